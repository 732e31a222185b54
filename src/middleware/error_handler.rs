use std::time::Instant;

use axum::{
    body::{Body, to_bytes},
    extract::{MatchedPath, State},
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use tracing::error;

use super::request_id::RequestId;
use crate::metrics::SharedMetrics;

/// 5xx 响应体最多记录的长度
const ERROR_BODY_LIMIT: usize = 4096;

pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.as_str().to_string());

    let response = next.run(req).await;
    if !response.status().is_server_error() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, ERROR_BODY_LIMIT).await {
        Ok(b) => b,
        Err(e) => {
            error!(%method, path, request_id, "Failed to read error response body: {}", e);
            parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(parts, Body::empty());
        }
    };

    error!(
        %method,
        path,
        request_id,
        status = parts.status.as_u16(),
        body = %String::from_utf8_lossy(&bytes),
        "Server error occurred"
    );

    // 重置body以便重新构建响应
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(bytes))
}

/// 按路由模板记录请求数与耗时
pub async fn track_requests(
    State(metrics): State<SharedMetrics>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let started = Instant::now();
    let response = next.run(req).await;
    metrics.record_request(&method, &path, response.status().as_u16(), started.elapsed());
    response
}
