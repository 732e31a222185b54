// 消息实体
// 定义消息及其向量任务状态

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// 向量生成状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EmbeddingStatus::Completed | EmbeddingStatus::Failed)
    }
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 数据库中出现了未知的状态值
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown embedding status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EmbeddingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmbeddingStatus::Pending),
            "processing" => Ok(EmbeddingStatus::Processing),
            "completed" => Ok(EmbeddingStatus::Completed),
            "failed" => Ok(EmbeddingStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for EmbeddingStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 消息实体，对应数据库中的 messages 表
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub metadata: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub embedding_status: EmbeddingStatus,
    pub embedding: Option<Vec<f32>>,
    pub embedding_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 最近一次被认领为 processing 的时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// 新建消息参数
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub embedding_status: EmbeddingStatus,
    pub embedding: Option<Vec<f32>>,
    pub embedding_error: Option<String>,
}

impl NewMessage {
    /// 待异步生成向量的消息
    pub fn pending(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            conversation_id: conversation_id.into(),
            role: role.into(),
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
            embedding_status: EmbeddingStatus::Pending,
            embedding: None,
            embedding_error: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// 同步生成向量的结果
    pub fn with_embedding_result(mut self, result: Result<Vec<f32>, String>) -> Self {
        match result {
            Ok(embedding) => {
                self.embedding_status = EmbeddingStatus::Completed;
                self.embedding = Some(embedding);
                self.embedding_error = None;
            }
            Err(error) => {
                self.embedding_status = EmbeddingStatus::Failed;
                self.embedding = None;
                self.embedding_error = Some(error);
            }
        }
        self
    }

    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            conversation_id: self.conversation_id,
            role: self.role,
            content: self.content,
            metadata: self.metadata,
            embedding_status: self.embedding_status,
            embedding: self.embedding,
            embedding_error: self.embedding_error,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            EmbeddingStatus::Pending,
            EmbeddingStatus::Processing,
            EmbeddingStatus::Completed,
            EmbeddingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EmbeddingStatus>().unwrap(), status);
        }
        assert!("done".parse::<EmbeddingStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&EmbeddingStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
