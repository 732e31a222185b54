use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::CacheBackend;
use crate::cache::error::CacheResult;
use crate::cache::models::CacheEntry;
use crate::utils::now_epoch_ms;

/// 进程内 TTL 缓存
///
/// 容量满时淘汰最早过期的一条，而不是最久未访问的一条；过期条目只在读取时清理。
#[derive(Debug)]
pub struct MemoryCache {
    max_items: usize,
    store: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.lock().await.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut store = self.store.lock().await;
        let now = now_epoch_ms();
        match store.get(key) {
            Some(entry) if entry.is_expired_at(now) => {
                store.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        let mut store = self.store.lock().await;
        if !store.contains_key(key) && store.len() >= self.max_items {
            let oldest = store
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at_ms)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                store.remove(&oldest);
            }
        }
        let expires_at_ms = now_epoch_ms() + ttl.as_millis() as i64;
        store.insert(key.to_string(), CacheEntry::new(value, expires_at_ms));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let mut store = self.store.lock().await;
        let before = store.len();
        store.retain(|key, _| !key.starts_with(prefix));
        Ok((before - store.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
