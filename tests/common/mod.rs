#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use memory_mesh::{
    AppState, build_router,
    cache::{
        CacheService, MemoryCache,
        operations::{MemoryRateLimiter, SharedRateLimiter},
    },
    config::Config,
    database::MemoryMessageRepository,
    embedding::{EmbeddingError, EmbeddingProvider, HashEmbedding, SharedEmbedder},
    metrics::PrometheusMetrics,
};
use serde_json::Value;
use tower::ServiceExt;

/// 限额足够大，不影响非限流相关的测试
pub fn test_config() -> Config {
    Config {
        global_rate_limit: "1000/minute".to_string(),
        tenant_rate_limit: "1000/minute".to_string(),
        ..Config::default()
    }
}

pub fn hash_embedder() -> SharedEmbedder {
    Arc::new(HashEmbedding::new(256))
}

pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn generate(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Provider("upstream timeout".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// 全部使用进程内组件的应用
pub fn test_app(config: Config, embedder: SharedEmbedder) -> (Router, AppState) {
    test_app_with_limiter(config, embedder, Arc::new(MemoryRateLimiter::new()))
}

pub fn test_app_with_limiter(
    config: Config,
    embedder: SharedEmbedder,
    limiter: SharedRateLimiter,
) -> (Router, AppState) {
    let cache = CacheService::new(Arc::new(MemoryCache::new(config.cache_max_items)), &config);
    let state = AppState::assemble(
        config,
        Arc::new(MemoryMessageRepository::new()),
        cache,
        limiter,
        embedder,
        Arc::new(PrometheusMetrics::new().unwrap()),
    )
    .unwrap();
    (build_router(state.clone()), state)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    TestResponse {
        status,
        headers,
        body,
    }
}
