use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, RequestExt,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Query, RawPathParams, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use super::request_id::RequestId;
use crate::cache::operations::{MemoryRateLimiter, SharedRateLimiter};
use crate::cache::{RateLimitConfig, RateLimitResult};
use crate::config::{Config, ConfigError};
use crate::metrics::SharedMetrics;
use crate::utils::now_epoch_ms;

/// 不做限流的路径
pub const EXEMPT_PATHS: &[&str] = &[
    "/v1/admin/health",
    "/v1/admin/readiness",
    "/metrics",
    "/docs",
    "/openapi.json",
];

/// 读取请求体查找租户时允许的最大长度
pub const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// 准入控制：先按 IP 做全局限流，再按租户限流
///
/// 共享后端出错时改用进程内计数，限额照常生效。
pub struct AdmissionControl {
    limiter: SharedRateLimiter,
    fallback: MemoryRateLimiter,
    metrics: SharedMetrics,
    global_limit: RateLimitConfig,
    global_limit_str: String,
    tenant_limit: RateLimitConfig,
    tenant_limit_str: String,
}

impl AdmissionControl {
    pub fn new(limiter: SharedRateLimiter, metrics: SharedMetrics, config: &Config) -> Result<Self, ConfigError> {
        let admission = Self {
            limiter,
            fallback: MemoryRateLimiter::new(),
            metrics,
            global_limit: config.global_limit()?,
            global_limit_str: config.global_rate_limit.clone(),
            tenant_limit: config.tenant_limit()?,
            tenant_limit_str: config.tenant_rate_limit.clone(),
        };
        tracing::info!(
            global_limit = admission.global_limit_str.as_str(),
            tenant_limit = admission.tenant_limit_str.as_str(),
            backend = admission.limiter.backend_name(),
            "rate_limit_initialized"
        );
        Ok(admission)
    }

    pub fn backend_name(&self) -> &'static str {
        self.limiter.backend_name()
    }

    async fn hit(&self, limit: &RateLimitConfig, identifier: &str) -> RateLimitResult {
        match self.limiter.hit(limit, identifier).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    identifier,
                    backend = self.limiter.backend_name(),
                    error = %e,
                    "rate_limit_backend_error_falling_back"
                );
                self.fallback.record(limit, identifier).await
            }
        }
    }
}

/// 从请求体查找租户失败的原因
///
/// 除 `Unreadable` 返回 413 外，其余都按"没有租户"处理。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantLookupError {
    #[error("request body is not valid JSON")]
    NotJson,
    #[error("request body is not a JSON object")]
    NotAnObject,
    #[error("request body has no tenant_id")]
    MissingField,
    #[error("request body could not be read: {0}")]
    Unreadable(String),
}

/// 从 JSON 请求体中读取 `tenant_id`
pub fn tenant_from_body(body: &[u8]) -> Result<String, TenantLookupError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| TenantLookupError::NotJson)?;
    let object = value.as_object().ok_or(TenantLookupError::NotAnObject)?;
    object
        .get("tenant_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(TenantLookupError::MissingField)
}

/// 请求头、路径参数、查询参数中的租户
fn tenant_hint(
    req: &Request<Body>,
    path_params: Option<&RawPathParams>,
    query: Option<&HashMap<String, String>>,
) -> Option<String> {
    let from_header = req
        .headers()
        .get("x-tenant-id")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if from_header.is_some() {
        return from_header;
    }

    let from_path = path_params.and_then(|params| {
        params
            .iter()
            .find(|(name, value)| *name == "tenant_id" && !value.is_empty())
            .map(|(_, value)| value.to_string())
    });
    if from_path.is_some() {
        return from_path;
    }

    query
        .and_then(|q| q.get("tenant_id"))
        .filter(|s| !s.is_empty())
        .cloned()
}

fn is_json_write(req: &Request<Body>) -> bool {
    let method = req.method();
    if method != Method::POST && method != Method::PUT && method != Method::PATCH {
        return false;
    }
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// 读出请求体查找租户，再把请求体原样放回
///
/// 请求体读不出来时外层返回错误，请求不能再继续转发。
async fn tenant_from_request_body(
    req: Request<Body>,
) -> Result<(Request<Body>, Result<String, TenantLookupError>), TenantLookupError> {
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| TenantLookupError::Unreadable(e.to_string()))?;
    let lookup = tenant_from_body(&bytes);
    Ok((Request::from_parts(parts, Body::from(bytes)), lookup))
}

fn ip_identifier(req: &Request<Body>) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = forwarded {
        return format!("ip:{}", ip);
    }
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

#[derive(Serialize)]
struct RejectionBody {
    detail: String,
    retry_after: i64,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

pub async fn admission(
    State(admission): State<Arc<AdmissionControl>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if EXEMPT_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }

    let path_params = req.extract_parts::<RawPathParams>().await.ok();
    let query = req.extract_parts::<Query<HashMap<String, String>>>().await.ok();
    let mut tenant_id = tenant_hint(&req, path_params.as_ref(), query.as_ref().map(|q| &q.0));
    if tenant_id.is_none() && is_json_write(&req) {
        let (restored, lookup) = match tenant_from_request_body(req).await {
            Ok(read) => read,
            Err(reason) => {
                tracing::warn!(path = path.as_str(), %reason, "request_body_rejected");
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(ErrorBody {
                        detail: format!("Request body could not be read within {} bytes", BODY_LIMIT),
                    }),
                )
                    .into_response();
            }
        };
        req = restored;
        match lookup {
            Ok(tenant) => tenant_id = Some(tenant),
            Err(reason) => tracing::debug!(path = path.as_str(), %reason, "tenant_lookup_skipped"),
        }
    }

    let ip = ip_identifier(&req);
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let global_state = admission.hit(&admission.global_limit, &ip).await;
    if !global_state.allowed {
        return reject(&admission, &ip, "global", None, &path, &request_id, &global_state);
    }

    let mut tenant_state = None;
    if let Some(tenant) = &tenant_id {
        let identifier = format!("tenant:{}", tenant);
        let state = admission.hit(&admission.tenant_limit, &identifier).await;
        if !state.allowed {
            return reject(
                &admission,
                &identifier,
                "tenant",
                Some(tenant),
                &path,
                &request_id,
                &state,
            );
        }
        tenant_state = Some(state);
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    apply_quota_headers(
        headers,
        ["x-ratelimit-limit", "x-ratelimit-remaining", "x-ratelimit-reset"],
        &admission.global_limit,
        &global_state,
    );
    if let Some(state) = &tenant_state {
        apply_quota_headers(
            headers,
            [
                "x-ratelimit-tenant-limit",
                "x-ratelimit-tenant-remaining",
                "x-ratelimit-tenant-reset",
            ],
            &admission.tenant_limit,
            state,
        );
    }
    response
}

fn apply_quota_headers(
    headers: &mut HeaderMap,
    names: [&'static str; 3],
    limit: &RateLimitConfig,
    state: &RateLimitResult,
) {
    let values = [
        limit.amount.to_string(),
        state.remaining(limit).to_string(),
        state.reset_epoch_secs().to_string(),
    ];
    for (name, value) in names.into_iter().zip(values) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn reject(
    admission: &AdmissionControl,
    identifier: &str,
    scope: &'static str,
    tenant_id: Option<&str>,
    path: &str,
    request_id: &str,
    state: &RateLimitResult,
) -> Response {
    let limit = match scope {
        "tenant" => admission.tenant_limit_str.as_str(),
        _ => admission.global_limit_str.as_str(),
    };
    tracing::warn!(identifier, scope, tenant_id, path, limit, "rate_limit_exceeded");
    admission.metrics.record_rate_limited(scope);

    let retry_after = (state.reset_epoch_ms / 1000 - now_epoch_ms() / 1000).max(1);
    let detail = match tenant_id {
        Some(tenant) => format!("Tenant rate limit exceeded for {}: {}", tenant, limit),
        None => format!("Rate limit exceeded: {}", limit),
    };

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RejectionBody {
            detail,
            retry_after,
        }),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    let request_id =
        HeaderValue::from_str(request_id).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    headers.insert(HeaderName::from_static("x-request-id"), request_id);
    response
}
