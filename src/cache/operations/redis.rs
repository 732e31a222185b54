use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use serde_json::Value;

use super::CacheBackend;
use crate::cache::error::CacheResult;
use crate::cache::keys::CACHE_PREFIX;

/// Redis 缓存，多进程部署时共享
///
/// 前缀删除用 SCAN + DEL，扫描期间新写入的匹配键不保证被删除，依赖 TTL 兜底。
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisCache {
    /// 建立连接并 PING 一次，连不上直接返回错误由调用方决定是否降级
    pub async fn connect(redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            prefix: CACHE_PREFIX.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

/// 转义 glob 特殊字符，SCAN MATCH 只按字面前缀匹配
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.full_key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&value)?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let _: () = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(json)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let mut scan_conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.full_key(prefix)));
        let keys: Vec<String> = scan_conn
            .scan_match::<_, String>(pattern)
            .await?
            .collect()
            .await;

        let mut conn = self.conn.clone();
        let mut deleted = 0u64;
        for chunk in keys.chunks(500) {
            let n: u64 = conn.del(chunk).await?;
            deleted += n;
        }
        Ok(deleted)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
