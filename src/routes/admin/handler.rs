use axum::{
    extract::{Json, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::AppError;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 存储不可达时返回 503
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    if let Err(e) = state.repository.ping().await {
        tracing::warn!(error = %e, "readiness_repository_unreachable");
        return Err(AppError::Unavailable("message store unreachable".to_string()));
    }
    Ok(Json(json!({
        "status": "ready",
        "cache": state.cache.backend_name(),
        "cache_enabled": state.cache.is_enabled(),
        "rate_limiter": state.admission.backend_name(),
        "embedder": state.embedder.name(),
        "async_embeddings": state.config.async_embeddings,
    })))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
