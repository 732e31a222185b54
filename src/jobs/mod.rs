// 后台任务
// 向量生成队列与独立 worker 进程的运行逻辑

pub mod queue;
pub mod worker;

pub use queue::EmbeddingJobQueue;
pub use worker::{WorkerExit, run_worker};
