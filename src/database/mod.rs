// 数据库模块
// 包含消息实体定义和存储库操作

use std::sync::Arc;

use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

pub mod models; // 数据库实体定义
pub mod operations; // 数据库操作实现

// 重新导出常用类型，方便其他模块使用
pub use models::message::{EmbeddingStatus, MessageRecord, NewMessage};
pub use operations::{
    MemoryMessageRepository, MessageRepository, PgMessageRepository, RepositoryError,
};

pub type SharedRepository = Arc<dyn MessageRepository>;

/// 配置了 DATABASE_URL 时连接 Postgres，否则使用进程内存储
pub async fn build_repository(config: &Config) -> Result<SharedRepository, RepositoryError> {
    let Some(database_url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, messages are kept in memory");
        return Ok(Arc::new(MemoryMessageRepository::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'memory_mesh';").await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    let repository = PgMessageRepository::new(Arc::new(pool));
    repository.migrate().await?;
    tracing::info!("Connected to Postgres message store");
    Ok(Arc::new(repository))
}
