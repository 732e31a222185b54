// 缓存模块
// 包含缓存键、数据模型、存储实现以及对外的缓存服务

pub mod error;
pub mod keys;
pub mod models;
pub mod operations;
pub mod service;

// 重新导出常用类型，方便其他模块使用
pub use error::{CacheError, CacheResult};
pub use models::{CacheEntry, RateLimitConfig, RateLimitResult};
pub use operations::{CacheBackend, MemoryCache, RedisCache};
pub use service::{CacheService, build_cache_backend};
