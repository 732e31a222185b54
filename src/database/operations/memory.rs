// 进程内消息存储
// 未配置 DATABASE_URL 时使用，也用于测试

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{MessageRepository, RepositoryError};
use crate::database::models::message::{EmbeddingStatus, MessageRecord, NewMessage};

#[derive(Debug, Default)]
struct Store {
    records: HashMap<Uuid, MessageRecord>,
    /// 插入顺序
    order: Vec<Uuid>,
}

/// 所有操作在同一把锁内完成，状态迁移天然是原子的
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    store: Mutex<Store>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, RepositoryError> {
        let record = message.into_record();
        let mut store = self.store.lock().await;
        store.order.push(record.id);
        store.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, RepositoryError> {
        Ok(self.store.lock().await.records.get(&id).cloned())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: EmbeddingStatus,
        next: EmbeddingStatus,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.lock().await;
        match store.records.get_mut(&id) {
            Some(record) if record.embedding_status == expected => {
                record.embedding_status = next;
                if next == EmbeddingStatus::Processing {
                    record.claimed_at = Some(Utc::now());
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(id)),
        }
    }

    async fn pending_ids(&self, limit: Option<usize>) -> Result<Vec<Uuid>, RepositoryError> {
        let store = self.store.lock().await;
        let pending = store
            .order
            .iter()
            .filter(|id| {
                store
                    .records
                    .get(*id)
                    .is_some_and(|r| r.embedding_status == EmbeddingStatus::Pending)
            })
            .copied();
        Ok(match limit {
            Some(n) => pending.take(n).collect(),
            None => pending.collect(),
        })
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, RepositoryError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(lease);
        let mut store = self.store.lock().await;
        let mut requeued = 0;
        for record in store.records.values_mut() {
            let expired = record.embedding_status == EmbeddingStatus::Processing
                && match (record.claimed_at, cutoff) {
                    (Some(claimed), Some(cutoff)) => claimed < cutoff,
                    // 没有认领时间的 processing 记录同样视为过期
                    (None, _) => true,
                    (Some(_), None) => false,
                };
            if expired {
                record.embedding_status = EmbeddingStatus::Pending;
                record.claimed_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn complete(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        let record = store
            .records
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        record.embedding_status = EmbeddingStatus::Completed;
        record.embedding = Some(embedding);
        record.embedding_error = None;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().await;
        let record = store
            .records
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        record.embedding_status = EmbeddingStatus::Failed;
        record.embedding_error = Some(error.to_string());
        Ok(())
    }

    async fn list_recent(
        &self,
        tenant_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let store = self.store.lock().await;
        Ok(store
            .order
            .iter()
            .rev()
            .filter_map(|id| store.records.get(id))
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| conversation_id.is_none_or(|c| r.conversation_id == c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
