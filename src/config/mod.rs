use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::cache::models::rate_limit::RateLimitConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid rate limit for {name}: {value}")]
    InvalidRateLimit { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub require_redis_in_production: bool,
    pub global_rate_limit: String,
    pub tenant_rate_limit: String,
    pub cache_enabled: bool,
    pub cache_search_ttl_secs: u64,
    pub cache_embedding_ttl_secs: u64,
    pub cache_max_items: usize,
    pub async_embeddings: bool,
    pub embedding_worker_in_process: bool,
    pub embedding_poll_interval_ms: u64,
    pub embedding_batch_size: usize,
    /// 认领后超过该时长仍未完成的任务重新放回队列
    pub embedding_claim_lease_secs: u64,
    pub embedding_dimensions: usize,
    pub embedding_api_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 8000,
            environment: "development".to_string(),
            database_url: None,
            redis_url: None,
            require_redis_in_production: true,
            global_rate_limit: "200/minute".to_string(),
            tenant_rate_limit: "100/minute".to_string(),
            cache_enabled: true,
            cache_search_ttl_secs: 60,
            cache_embedding_ttl_secs: 3600,
            cache_max_items: 2000,
            async_embeddings: false,
            embedding_worker_in_process: false,
            embedding_poll_interval_ms: 1000,
            embedding_batch_size: 32,
            embedding_claim_lease_secs: 300,
            embedding_dimensions: 256,
            embedding_api_url: None,
            embedding_api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_timeout_secs: 30,
        }
    }
}

impl Config {
    /// 从环境变量加载配置，未设置的字段使用默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Config::default();
        let config = Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_var("SERVER_PORT", defaults.server_port)?,
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            database_url: optional_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            require_redis_in_production: parse_bool(
                "REQUIRE_REDIS_IN_PRODUCTION",
                defaults.require_redis_in_production,
            )?,
            global_rate_limit: env::var("GLOBAL_RATE_LIMIT").unwrap_or(defaults.global_rate_limit),
            tenant_rate_limit: env::var("TENANT_RATE_LIMIT").unwrap_or(defaults.tenant_rate_limit),
            cache_enabled: parse_bool("CACHE_ENABLED", defaults.cache_enabled)?,
            cache_search_ttl_secs: parse_var(
                "CACHE_SEARCH_TTL_SECONDS",
                defaults.cache_search_ttl_secs,
            )?,
            cache_embedding_ttl_secs: parse_var(
                "CACHE_EMBEDDING_TTL_SECONDS",
                defaults.cache_embedding_ttl_secs,
            )?,
            cache_max_items: parse_var("CACHE_MAX_ITEMS", defaults.cache_max_items)?,
            async_embeddings: parse_bool("ASYNC_EMBEDDINGS", defaults.async_embeddings)?,
            embedding_worker_in_process: parse_bool(
                "EMBEDDING_WORKER_IN_PROCESS",
                defaults.embedding_worker_in_process,
            )?,
            embedding_poll_interval_ms: parse_var(
                "EMBEDDING_POLL_INTERVAL_MS",
                defaults.embedding_poll_interval_ms,
            )?,
            embedding_batch_size: parse_var("EMBEDDING_BATCH_SIZE", defaults.embedding_batch_size)?,
            embedding_claim_lease_secs: parse_var(
                "EMBEDDING_CLAIM_LEASE_SECONDS",
                defaults.embedding_claim_lease_secs,
            )?,
            embedding_dimensions: parse_var("EMBEDDING_DIMENSIONS", defaults.embedding_dimensions)?,
            embedding_api_url: optional_var("EMBEDDING_API_URL"),
            embedding_api_key: optional_var("EMBEDDING_API_KEY"),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_timeout_secs: parse_var(
                "EMBEDDING_TIMEOUT_SECONDS",
                defaults.embedding_timeout_secs,
            )?,
        };

        // 限流字符串在启动时校验，格式错误直接失败
        config.global_limit()?;
        config.tenant_limit()?;

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// 生产环境下 Redis 不可用时是否必须终止启动
    pub fn redis_required(&self) -> bool {
        self.is_production() && self.require_redis_in_production
    }

    pub fn global_limit(&self) -> Result<RateLimitConfig, ConfigError> {
        self.global_rate_limit
            .parse()
            .map_err(|_| ConfigError::InvalidRateLimit {
                name: "GLOBAL_RATE_LIMIT",
                value: self.global_rate_limit.clone(),
            })
    }

    pub fn tenant_limit(&self) -> Result<RateLimitConfig, ConfigError> {
        self.tenant_rate_limit
            .parse()
            .map_err(|_| ConfigError::InvalidRateLimit {
                name: "TENANT_RATE_LIMIT",
                value: self.tenant_rate_limit.clone(),
            })
    }

    pub fn cache_search_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_search_ttl_secs)
    }

    pub fn cache_embedding_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_embedding_ttl_secs)
    }

    pub fn embedding_poll_interval(&self) -> Duration {
        Duration::from_millis(self.embedding_poll_interval_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs.max(1))
    }

    pub fn embedding_claim_lease(&self) -> Duration {
        Duration::from_secs(self.embedding_claim_lease_secs.max(1))
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional_var(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_parse() {
        let config = Config::default();
        assert_eq!(config.global_limit().unwrap().amount, 200);
        assert_eq!(config.tenant_limit().unwrap().window_seconds, 60);
    }

    #[test]
    fn bad_limit_is_config_error() {
        let config = Config {
            tenant_rate_limit: "lots".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.tenant_limit(),
            Err(ConfigError::InvalidRateLimit { name: "TENANT_RATE_LIMIT", .. })
        ));
    }

    #[test]
    fn redis_only_required_in_production() {
        let mut config = Config::default();
        assert!(!config.redis_required());
        config.environment = "Production".to_string();
        assert!(config.redis_required());
        config.require_redis_in_production = false;
        assert!(!config.redis_required());
    }
}
