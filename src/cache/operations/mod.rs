/// 缓存操作
/// 进程内与 Redis 两种存储实现，构造时按配置二选一
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::error::CacheResult;

pub mod memory;
pub mod rate_limit;
pub mod redis;

pub use memory::MemoryCache;
pub use rate_limit::{
    MemoryRateLimiter, RateLimitError, RedisRateLimiter, SharedRateLimiter, WindowCounter,
    build_rate_limiter, enforce_tenant_rate_limit,
};
pub use self::redis::RedisCache;

/// 带过期时间和前缀删除的键值存储
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// 读取未过期的值
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()>;

    /// 删除所有以 `prefix` 开头的键，返回删除数量
    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64>;

    fn name(&self) -> &'static str;
}
