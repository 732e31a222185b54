// 消息存储库
// Postgres 实现，认领依赖带条件的 UPDATE

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MessageRepository, RepositoryError};
use crate::database::models::message::{EmbeddingStatus, MessageRecord, NewMessage};

const MESSAGE_COLUMNS: &str = "id, tenant_id, conversation_id, role, content, metadata, \
     embedding_status, embedding, embedding_error, created_at, claimed_at";

/// 消息存储库，处理所有与消息相关的数据库操作
#[derive(Clone)]
pub struct PgMessageRepository {
    db: Arc<PgPool>,
}

impl PgMessageRepository {
    /// 创建新的消息存储库实例
    pub fn new(db: Arc<PgPool>) -> Self {
        Self { db }
    }

    /// 表不存在时创建
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                embedding_status TEXT NOT NULL DEFAULT 'pending',
                embedding REAL[],
                embedding_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&*self.db)
        .await?;

        // 旧表补列
        sqlx::query("ALTER TABLE messages ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ")
            .execute(&*self.db)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_pending
                ON messages (created_at)
                WHERE embedding_status = 'pending'
            "#,
        )
        .execute(&*self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_processing
                ON messages (claimed_at)
                WHERE embedding_status = 'processing'
            "#,
        )
        .execute(&*self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_tenant_conversation
                ON messages (tenant_id, conversation_id, created_at DESC)
            "#,
        )
        .execute(&*self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: NewMessage) -> Result<MessageRecord, RepositoryError> {
        let record = message.into_record();
        sqlx::query(
            r#"
            INSERT INTO messages (id, tenant_id, conversation_id, role, content, metadata,
                                  embedding_status, embedding, embedding_error, created_at, claimed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.tenant_id)
        .bind(&record.conversation_id)
        .bind(&record.role)
        .bind(&record.content)
        .bind(&record.metadata)
        .bind(record.embedding_status.as_str())
        .bind(&record.embedding)
        .bind(&record.embedding_error)
        .bind(record.created_at)
        .bind(record.claimed_at)
        .execute(&*self.db)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, RepositoryError> {
        let sql = format!("SELECT {} FROM messages WHERE id = $1", MESSAGE_COLUMNS);
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(record)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: EmbeddingStatus,
        next: EmbeddingStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET embedding_status = $3,
                claimed_at = CASE WHEN $3::TEXT = 'processing' THEN NOW() ELSE claimed_at END
            WHERE id = $1 AND embedding_status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // 区分“被别人抢先”与“记录不存在”
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM messages WHERE id = $1)")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound(id))
        }
    }

    async fn pending_ids(&self, limit: Option<usize>) -> Result<Vec<Uuid>, RepositoryError> {
        // LIMIT NULL 即不限制
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM messages
            WHERE embedding_status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit.map(|n| n as i64))
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET embedding_status = 'pending', claimed_at = NULL
            WHERE embedding_status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < NOW() - ($1::BIGINT * INTERVAL '1 millisecond'))
            "#,
        )
        .bind(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn complete(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET embedding_status = 'completed', embedding = $2, embedding_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(embedding)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET embedding_status = 'failed', embedding_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn list_recent(
        &self,
        tenant_id: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {} FROM messages
            WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR conversation_id = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
            MESSAGE_COLUMNS
        );
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(tenant_id)
            .bind(conversation_id)
            .bind(limit as i64)
            .fetch_all(&*self.db)
            .await?;
        Ok(records)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&*self.db).await?;
        Ok(())
    }
}
