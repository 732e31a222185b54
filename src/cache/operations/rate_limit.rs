use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::error::CacheError;
use crate::cache::keys::rate_limit_key;
use crate::cache::models::rate_limit::{RateLimitConfig, RateLimitResult};
use crate::config::Config;
use crate::utils::now_epoch_ms;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(#[from] CacheError),
    /// 旧的同步限流入口已废弃，调用即报错以暴露遗留调用点
    #[error("enforce_tenant_rate_limit is no longer supported; use the admission middleware instead")]
    LegacyHookUnsupported,
}

/// 固定窗口计数器
///
/// 同一 identifier 的并发 hit 必须线性化：不能有两个调用看到相同的自增前计数。
#[async_trait]
pub trait WindowCounter: Send + Sync + 'static {
    async fn hit(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
    ) -> Result<RateLimitResult, RateLimitError>;

    fn backend_name(&self) -> &'static str;
}

/// 进程级共享的限流器句柄
pub type SharedRateLimiter = Arc<dyn WindowCounter>;

/// 过期窗口的清理间隔
const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Debug)]
struct Window {
    window_ms: i64,
    entries: VecDeque<i64>,
}

#[derive(Debug, Default)]
struct Windows {
    by_key: HashMap<String, Window>,
    last_sweep_ms: i64,
}

impl Windows {
    /// 删除最新一次命中也已过期的窗口，identifier 由客户端决定，不清理会无限增长
    fn sweep(&mut self, now: i64) {
        if now - self.last_sweep_ms < SWEEP_INTERVAL_MS {
            return;
        }
        self.last_sweep_ms = now;
        self.by_key
            .retain(|_, w| w.entries.back().is_some_and(|ts| *ts > now - w.window_ms));
    }
}

/// 进程内限流器，一把锁保护全部窗口
#[derive(Debug, Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<Windows>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(config: &RateLimitConfig, identifier: &str) -> String {
        format!(
            "{}:{}:{}",
            config.amount, config.window_seconds, identifier
        )
    }

    /// 计数一次，进程内实现不会失败
    pub async fn record(&self, config: &RateLimitConfig, identifier: &str) -> RateLimitResult {
        let key = Self::key(config, identifier);
        let window_ms = config.window_ms();

        let mut windows = self.windows.lock().await;
        let now = now_epoch_ms();
        windows.sweep(now);

        let window = windows.by_key.entry(key).or_insert_with(|| Window {
            window_ms,
            entries: VecDeque::new(),
        });
        let window_start = now - window_ms;
        while window.entries.front().is_some_and(|ts| *ts <= window_start) {
            window.entries.pop_front();
        }
        window.entries.push_back(now);

        let count = window.entries.len() as u64;
        let reset_epoch_ms = window.entries.front().map_or(now, |oldest| *oldest) + window_ms;

        RateLimitResult {
            allowed: count <= config.amount,
            count,
            reset_epoch_ms,
        }
    }

    /// 当前保留的窗口数
    pub async fn tracked_windows(&self) -> usize {
        self.windows.lock().await.by_key.len()
    }
}

#[async_trait]
impl WindowCounter for MemoryRateLimiter {
    async fn hit(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        Ok(self.record(config, identifier).await)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// INCR 与首次 PEXPIRE 在同一脚本里执行，避免读后写竞争
const HIT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {current, ttl}
"#;

/// Redis 限流器，多进程共享计数
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: MultiplexedConnection,
    script: Arc<redis::Script>,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            script: Arc::new(redis::Script::new(HIT_SCRIPT)),
        })
    }
}

#[async_trait]
impl WindowCounter for RedisRateLimiter {
    async fn hit(
        &self,
        config: &RateLimitConfig,
        identifier: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        let key = rate_limit_key(config.amount, config.window_seconds, identifier);
        let window_ms = config.window_ms();

        let mut conn = self.conn.clone();
        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(&key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(CacheError::from)?;

        // 没有过期时间说明之前设置过期失败，按整窗处理
        let ttl_ms = if ttl_ms < 0 { window_ms } else { ttl_ms.max(1) };
        let count = count.max(1) as u64;

        Ok(RateLimitResult {
            allowed: count <= config.amount,
            count,
            reset_epoch_ms: now_epoch_ms() + ttl_ms,
        })
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// 按配置构造限流器
///
/// 配置了 REDIS_URL 时优先使用 Redis；连接失败时降级到进程内实现，
/// 但生产环境且要求 Redis 时直接返回错误。
pub async fn build_rate_limiter(config: &Config) -> Result<SharedRateLimiter, CacheError> {
    if let Some(url) = &config.redis_url {
        match RedisRateLimiter::connect(url).await {
            Ok(limiter) => {
                tracing::info!("rate_limit_redis_backend_enabled");
                return Ok(Arc::new(limiter));
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate_limit_redis_backend_failed");
                if config.redis_required() {
                    return Err(e);
                }
            }
        }
    }
    tracing::info!("rate_limit_in_memory_backend_enabled");
    Ok(Arc::new(MemoryRateLimiter::new()))
}

/// 旧的同步限流入口，保留签名但始终失败
pub fn enforce_tenant_rate_limit(_tenant_id: &str) -> Result<(), RateLimitError> {
    Err(RateLimitError::LegacyHookUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(amount: u64, window_seconds: u64) -> RateLimitConfig {
        RateLimitConfig {
            amount,
            window_seconds,
        }
    }

    #[tokio::test]
    async fn blocks_after_threshold() {
        let limiter = MemoryRateLimiter::new();
        let cfg = config(2, 60);

        let first = limiter.hit(&cfg, "client").await.unwrap();
        let second = limiter.hit(&cfg, "client").await.unwrap();
        let third = limiter.hit(&cfg, "client").await.unwrap();

        assert!(first.allowed && second.allowed);
        assert!(!third.allowed);
        assert_eq!(third.count, 3);
        assert!(third.reset_epoch_ms > 0);
    }

    #[tokio::test]
    async fn amount_hits_allowed_then_rejected() {
        let limiter = MemoryRateLimiter::new();
        for amount in [1u64, 3, 7] {
            let cfg = config(amount, 60);
            let id = format!("id-{amount}");
            for n in 1..=amount {
                let before = now_epoch_ms();
                let result = limiter.hit(&cfg, &id).await.unwrap();
                assert!(result.allowed);
                assert_eq!(result.count, n);
                assert!(result.reset_epoch_ms > before);
            }
            let over = limiter.hit(&cfg, &id).await.unwrap();
            assert!(!over.allowed);
            assert_eq!(over.count, amount + 1);
        }
    }

    #[tokio::test]
    async fn reset_is_anchored_to_first_hit() {
        let limiter = MemoryRateLimiter::new();
        let cfg = config(10, 60);
        let first = limiter.hit(&cfg, "anchor").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = limiter.hit(&cfg, "anchor").await.unwrap();
        assert_eq!(first.reset_epoch_ms, second.reset_epoch_ms);
    }

    #[tokio::test]
    async fn identifiers_and_configs_are_isolated() {
        let limiter = MemoryRateLimiter::new();
        let cfg = config(1, 60);
        assert!(limiter.hit(&cfg, "a").await.unwrap().allowed);
        assert!(limiter.hit(&cfg, "b").await.unwrap().allowed);
        assert!(!limiter.hit(&cfg, "a").await.unwrap().allowed);
        // 不同配置使用不同窗口
        assert!(limiter.hit(&config(5, 60), "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn window_expires() {
        let limiter = MemoryRateLimiter::new();
        let cfg = config(1, 1);
        assert!(limiter.hit(&cfg, "w").await.unwrap().allowed);
        assert!(!limiter.hit(&cfg, "w").await.unwrap().allowed);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let fresh = limiter.hit(&cfg, "w").await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn expired_windows_are_swept() {
        let limiter = MemoryRateLimiter::new();
        let cfg = config(10, 1);
        for i in 0..500 {
            limiter.record(&cfg, &format!("ip:10.0.{}.{}", i / 256, i % 256)).await;
        }
        assert_eq!(limiter.tracked_windows().await, 500);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let fresh = limiter.record(&cfg, "ip:192.168.0.1").await;
        assert_eq!(fresh.count, 1);
        assert_eq!(limiter.tracked_windows().await, 1);
    }

    #[tokio::test]
    async fn sweep_keeps_active_longer_windows() {
        let limiter = MemoryRateLimiter::new();
        limiter.record(&config(10, 60), "long").await;
        limiter.record(&config(10, 1), "short").await;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        limiter.record(&config(10, 1), "other").await;
        assert_eq!(limiter.tracked_windows().await, 2);
        assert_eq!(limiter.record(&config(10, 60), "long").await.count, 2);
    }

    #[tokio::test]
    async fn concurrent_hits_observe_distinct_counts() {
        let limiter = Arc::new(MemoryRateLimiter::new());
        let cfg = config(50, 60);
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.hit(&cfg, "shared").await.unwrap()
            }));
        }
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().count);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn falls_back_to_memory_outside_production() {
        let cfg = Config {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            ..Config::default()
        };
        let limiter = build_rate_limiter(&cfg).await.unwrap();
        assert_eq!(limiter.backend_name(), "memory");
    }

    #[tokio::test]
    async fn strict_production_refuses_fallback() {
        let cfg = Config {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            environment: "production".to_string(),
            require_redis_in_production: true,
            ..Config::default()
        };
        assert!(build_rate_limiter(&cfg).await.is_err());
    }

    #[test]
    fn legacy_hook_fails_loudly() {
        let err = enforce_tenant_rate_limit("tenant-a").unwrap_err();
        assert!(matches!(err, RateLimitError::LegacyHookUnsupported));
        assert!(err.to_string().contains("no longer supported"));
    }

    #[tokio::test]
    #[ignore]
    async fn redis_limiter_counts_atomically() {
        let limiter = RedisRateLimiter::connect("redis://127.0.0.1:6379").await.unwrap();
        let cfg = config(2, 60);
        let id = format!("test-{}", uuid::Uuid::new_v4());
        assert!(limiter.hit(&cfg, &id).await.unwrap().allowed);
        assert!(limiter.hit(&cfg, &id).await.unwrap().allowed);
        let third = limiter.hit(&cfg, &id).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.count, 3);
        assert!(third.reset_epoch_ms > now_epoch_ms());
    }
}
