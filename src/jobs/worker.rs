use std::future::Future;
use std::sync::Arc;

use super::EmbeddingJobQueue;
use crate::config::Config;

/// worker 退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// 未开启异步向量生成，没有启动
    Disabled,
    /// 收到停止信号后正常退出
    Stopped,
}

/// 运行队列直到 `shutdown` 完成
///
/// 未开启 `ASYNC_EMBEDDINGS` 时只记录错误并立即返回。
pub async fn run_worker<F>(config: &Config, queue: Arc<EmbeddingJobQueue>, shutdown: F) -> WorkerExit
where
    F: Future<Output = ()>,
{
    if !config.async_embeddings {
        tracing::error!("ASYNC_EMBEDDINGS is disabled, embedding worker will not start");
        return WorkerExit::Disabled;
    }

    queue.start().await;
    // 启动时先处理一次积压
    queue.notify();
    shutdown.await;
    queue.stop().await;
    WorkerExit::Stopped
}
