use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 限流配置：窗口内允许的请求数
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitConfig {
    pub amount: u64,
    pub window_seconds: u64,
}

impl RateLimitConfig {
    pub fn window_ms(&self) -> i64 {
        (self.window_seconds * 1000) as i64
    }
}

impl fmt::Display for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.amount, self.window_seconds)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid rate limit format: {0}")]
pub struct ParseRateLimitError(pub String);

/// 解析形如 `200/minute`、`10 per second`、`5 hours` 的限流字符串
impl FromStr for RateLimitConfig {
    type Err = ParseRateLimitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseRateLimitError(raw.to_string());

        let s = raw.trim().to_ascii_lowercase();
        let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if digits_end == 0 {
            return Err(invalid());
        }
        let amount: u64 = s[..digits_end].parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }

        let mut rest = s[digits_end..].trim_start();
        if let Some(r) = rest.strip_prefix('/') {
            rest = r.trim_start();
        }
        if let Some(r) = rest.strip_prefix("per") {
            if !r.starts_with(char::is_whitespace) {
                return Err(invalid());
            }
            rest = r.trim_start();
        }

        let unit = rest.strip_suffix('s').unwrap_or(rest);
        let window_seconds = match unit {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            "day" => 86400,
            _ => return Err(invalid()),
        };

        Ok(RateLimitConfig {
            amount,
            window_seconds,
        })
    }
}

/// 单次 hit 的判定结果
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub count: u64,
    pub reset_epoch_ms: i64,
}

impl RateLimitResult {
    pub fn remaining(&self, config: &RateLimitConfig) -> u64 {
        config.amount.saturating_sub(self.count)
    }

    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_epoch_ms / 1000
    }
}
