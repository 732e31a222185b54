// 数据库操作
// 消息存储接口与两种实现

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::database::models::message::{EmbeddingStatus, MessageRecord, NewMessage};

pub mod memory;
pub mod message;

pub use memory::MemoryMessageRepository;
pub use message::PgMessageRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("message not found: {0}")]
    NotFound(Uuid),
}

/// 消息存储接口
///
/// `transition_status` 必须是原子的比较并设置：并发调用时最多一个调用方成功，
/// 多个 worker 依靠它认领任务。
#[async_trait]
pub trait MessageRepository: Send + Sync + 'static {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, RepositoryError>;

    /// 状态为 `expected` 时改为 `next`，返回是否成功；改为 processing 时记下认领时间
    async fn transition_status(
        &self,
        id: Uuid,
        expected: EmbeddingStatus,
        next: EmbeddingStatus,
    ) -> Result<bool, RepositoryError>;

    /// 按创建时间先后列出待处理消息，`limit` 为空时不限制
    async fn pending_ids(&self, limit: Option<usize>) -> Result<Vec<Uuid>, RepositoryError>;

    /// 认领超过 `lease` 仍停在 processing 的消息放回 pending，返回条数
    ///
    /// worker 在处理中途退出时，消息靠它重新进入队列。
    async fn requeue_stale(&self, lease: Duration) -> Result<u64, RepositoryError>;

    /// processing -> completed，同时写入向量
    async fn complete(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), RepositoryError>;

    /// processing -> failed，记录错误信息
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), RepositoryError>;

    /// 租户（可选会话）下最近的消息，新的在前
    async fn list_recent(
        &self,
        tenant_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, RepositoryError>;

    /// 存储可用性检查
    async fn ping(&self) -> Result<(), RepositoryError>;
}
