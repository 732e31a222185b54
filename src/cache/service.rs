use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use super::error::CacheError;
use super::keys;
use super::operations::{CacheBackend, MemoryCache, RedisCache};
use crate::config::Config;

/// 检索与向量缓存
///
/// 缓存只是优化：后端出错一律按未命中处理，写入失败只记日志。
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    search_ttl: Duration,
    embedding_ttl: Duration,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &Config) -> Self {
        Self {
            backend,
            enabled: config.cache_enabled,
            search_ttl: config.cache_search_ttl(),
            embedding_ttl: config.cache_embedding_ttl(),
        }
    }

    /// 按配置选择后端；测试里再调用一次即可得到全新实例
    pub async fn from_config(config: &Config) -> Result<Self, CacheError> {
        let backend = build_cache_backend(config).await?;
        Ok(Self::new(backend, config))
    }

    pub fn disabled() -> Self {
        let config = Config {
            cache_enabled: false,
            ..Config::default()
        };
        Self::new(Arc::new(MemoryCache::new(1)), &config)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn embedding_ttl(&self) -> Duration {
        self.embedding_ttl
    }

    pub fn search_key(
        &self,
        tenant_id: &str,
        conversation_id: Option<&str>,
        query: &str,
        top_k: u32,
        candidate_limit: u32,
    ) -> String {
        keys::search_key(tenant_id, conversation_id, query, top_k, candidate_limit)
    }

    pub fn embedding_key(&self, text: &str) -> String {
        keys::embedding_key(text)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        match self.backend.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(key, error = %e, "cache_decode_failed");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache_get_failed");
                None
            }
        }
    }

    /// 写入缓存，`ttl` 为空时使用检索缓存的默认 TTL
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache_encode_failed");
                return;
            }
        };
        let ttl = ttl.unwrap_or(self.search_ttl);
        if let Err(e) = self.backend.set(key, value, ttl).await {
            tracing::warn!(key, error = %e, "cache_set_failed");
        }
    }

    /// 检索缓存失效
    ///
    /// 指定会话时删除该会话与跨会话检索的结果；不指定时删除整个租户的检索缓存。
    pub async fn invalidate_search(&self, tenant_id: &str, conversation_id: Option<&str>) {
        if !self.enabled {
            return;
        }
        let prefixes = match conversation_id {
            Some(conversation) => vec![
                keys::scope_search_prefix(tenant_id, Some(conversation)),
                keys::scope_search_prefix(tenant_id, None),
            ],
            None => vec![keys::tenant_search_prefix(tenant_id)],
        };
        let mut removed = 0;
        for prefix in &prefixes {
            match self.backend.delete_prefix(prefix).await {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::warn!(prefix = prefix.as_str(), error = %e, "cache_invalidate_failed")
                }
            }
        }
        tracing::debug!(tenant_id, conversation_id, removed, "cache_invalidated");
    }
}

/// 配置了 REDIS_URL 时使用 Redis；连接失败时降级为进程内缓存，生产严格模式下报错
pub async fn build_cache_backend(config: &Config) -> Result<Arc<dyn CacheBackend>, CacheError> {
    if let Some(url) = &config.redis_url {
        match RedisCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("cache_redis_backend_enabled");
                return Ok(Arc::new(cache));
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache_redis_backend_failed");
                if config.redis_required() {
                    return Err(e);
                }
            }
        }
    } else if config.redis_required() {
        return Err(CacheError::Connection(
            "Redis is required for cache in production environment".to_string(),
        ));
    }
    tracing::info!(max_items = config.cache_max_items, "cache_in_memory_backend_enabled");
    Ok(Arc::new(MemoryCache::new(config.cache_max_items)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cache::error::CacheResult;

    /// 记录调用次数、所有操作都失败的后端
    #[derive(Default)]
    struct BrokenBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> CacheResult<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Connection("down".into()))
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> CacheResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Connection("down".into()))
        }

        async fn delete_prefix(&self, _prefix: &str) -> CacheResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Connection("down".into()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn service(max_items: usize) -> CacheService {
        CacheService::new(Arc::new(MemoryCache::new(max_items)), &Config::default())
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = service(10);
        cache.set("k", &vec![1.0f32, 2.0], None).await;
        assert_eq!(cache.get::<Vec<f32>>("k").await, Some(vec![1.0, 2.0]));
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let cache = service(10);
        cache.set("k", &"v", Some(Duration::from_millis(30))).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get::<String>("k").await, None);
    }

    #[tokio::test]
    async fn disabled_never_touches_backend() {
        let backend = Arc::new(BrokenBackend::default());
        let cache = CacheService::new(backend.clone(), &Config::default()).with_enabled(false);
        cache.set("k", &1, None).await;
        assert_eq!(cache.get::<i32>("k").await, None);
        cache.invalidate_search("t", None).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backend_errors_become_misses() {
        let backend = Arc::new(BrokenBackend::default());
        let cache = CacheService::new(backend.clone(), &Config::default());
        cache.set("k", &1, None).await;
        assert_eq!(cache.get::<i32>("k").await, None);
        cache.invalidate_search("t", Some("c")).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn invalidation_targets_tenant_and_conversation() {
        let cache = service(100);
        let c1 = cache.search_key("t1", Some("c1"), "q", 3, 50);
        let c2 = cache.search_key("t1", Some("c2"), "q", 3, 50);
        let any = cache.search_key("t1", None, "q", 3, 50);
        let other = cache.search_key("t2", Some("c1"), "q", 3, 50);
        for key in [&c1, &c2, &any, &other] {
            cache.set(key, &"hit", None).await;
        }

        cache.invalidate_search("t1", Some("c1")).await;
        assert_eq!(cache.get::<String>(&c1).await, None);
        assert_eq!(cache.get::<String>(&any).await, None);
        assert!(cache.get::<String>(&c2).await.is_some());
        assert!(cache.get::<String>(&other).await.is_some());

        cache.invalidate_search("t1", None).await;
        assert_eq!(cache.get::<String>(&c2).await, None);
        assert!(cache.get::<String>(&other).await.is_some());
    }

    #[tokio::test]
    async fn strict_production_without_redis_fails() {
        let config = Config {
            environment: "production".to_string(),
            ..Config::default()
        };
        assert!(build_cache_backend(&config).await.is_err());

        let relaxed = Config {
            require_redis_in_production: false,
            ..config
        };
        assert_eq!(build_cache_backend(&relaxed).await.unwrap().name(), "memory");
    }
}
