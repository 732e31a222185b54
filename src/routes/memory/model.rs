use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

pub const MAX_TOP_K: u32 = 50;
pub const MAX_CANDIDATE_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub tenant_id: String,
    pub conversation_id: Option<String>,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: u32,
}

fn default_top_k() -> u32 {
    5
}

fn default_candidate_limit() -> u32 {
    50
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.tenant_id.trim().is_empty() {
            return Err(AppError::Validation("tenant_id must not be empty".to_string()));
        }
        if self.query.trim().is_empty() {
            return Err(AppError::Validation("query must not be empty".to_string()));
        }
        if self.top_k == 0 || self.top_k > MAX_TOP_K {
            return Err(AppError::Validation(format!(
                "top_k must be between 1 and {}",
                MAX_TOP_K
            )));
        }
        if self.candidate_limit == 0 || self.candidate_limit > MAX_CANDIDATE_LIMIT {
            return Err(AppError::Validation(format!(
                "candidate_limit must be between 1 and {}",
                MAX_CANDIDATE_LIMIT
            )));
        }
        Ok(())
    }

    /// 空字符串的会话等同于不限会话
    pub fn conversation(&self) -> Option<&str> {
        self.conversation_id.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: usize,
    pub cached: bool,
    pub results: Vec<SearchHit>,
}
