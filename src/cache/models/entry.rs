use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 进程内缓存条目
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CacheEntry {
    pub expires_at_ms: i64, // Unix timestamp (ms)
    pub value: Value,
}

impl CacheEntry {
    pub fn new(value: Value, expires_at_ms: i64) -> Self {
        Self {
            expires_at_ms,
            value,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}
