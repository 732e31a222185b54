use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use thiserror::Error;

use cache::CacheService;
use cache::operations::{SharedRateLimiter, build_rate_limiter};
use config::{Config, ConfigError};
use database::{RepositoryError, SharedRepository, build_repository};
use embedding::{SharedEmbedder, build_embedder};
use jobs::EmbeddingJobQueue;
use metrics::{PrometheusMetrics, SharedMetrics};
use middleware::{AdmissionControl, admission, log_errors, request_id, track_requests};

pub mod cache;
pub mod config;
pub mod database;
pub mod embedding;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod utils;

/// 启动阶段的致命错误
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cache backend unavailable: {0}")]
    Cache(#[from] cache::CacheError),
    #[error("message store unavailable: {0}")]
    Repository(#[from] RepositoryError),
    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("embedding provider unavailable: {0}")]
    Embedding(#[from] embedding::EmbeddingError),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: SharedRepository,
    pub cache: CacheService,
    pub embedder: SharedEmbedder,
    pub jobs: Arc<EmbeddingJobQueue>,
    pub metrics: SharedMetrics,
    pub admission: Arc<AdmissionControl>,
}

impl AppState {
    /// 按配置构造所有组件
    pub async fn build(config: Config) -> Result<Self, StartupError> {
        let repository = build_repository(&config).await?;
        let cache = CacheService::from_config(&config).await?;
        let limiter = build_rate_limiter(&config).await?;
        let embedder = build_embedder(&config)?;
        let metrics: SharedMetrics = Arc::new(PrometheusMetrics::new()?);
        Self::assemble(config, repository, cache, limiter, embedder, metrics)
    }

    /// 用现成的组件组装状态
    pub fn assemble(
        config: Config,
        repository: SharedRepository,
        cache: CacheService,
        limiter: SharedRateLimiter,
        embedder: SharedEmbedder,
        metrics: SharedMetrics,
    ) -> Result<Self, StartupError> {
        let admission = Arc::new(AdmissionControl::new(limiter, metrics.clone(), &config)?);
        let jobs = Arc::new(EmbeddingJobQueue::new(
            repository.clone(),
            embedder.clone(),
            cache.clone(),
            metrics.clone(),
            &config,
        ));
        Ok(Self {
            config: Arc::new(config),
            repository,
            cache,
            embedder,
            jobs,
            metrics,
            admission,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/v1/messages", post(routes::message::create_message))
        .route("/v1/messages/{id}", get(routes::message::get_message))
        .route(
            "/v1/tenants/{tenant_id}/messages",
            get(routes::message::list_tenant_messages),
        )
        .route("/v1/memory/search", get(routes::memory::search))
        .route("/v1/admin/health", get(routes::admin::health))
        .route("/v1/admin/readiness", get(routes::admin::readiness))
        .route("/metrics", get(routes::admin::metrics))
        // 路由匹配后执行，才能拿到路径参数和路由模板
        .route_layer(axum::middleware::from_fn_with_state(
            state.admission.clone(),
            admission,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.metrics.clone(),
            track_requests,
        ))
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn(request_id));

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = router.layer(tower_http::cors::CorsLayer::permissive());

    router.with_state(state)
}
