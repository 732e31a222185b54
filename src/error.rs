use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::database::RepositoryError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("Failed to store message")]
    FailedToStoreMessage(#[source] RepositoryError),
    #[error("Failed to load message")]
    FailedToGetMessage(#[source] RepositoryError),
    #[error("Search failed")]
    SearchFailed(#[source] RepositoryError),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::FailedToStoreMessage(_)
            | AppError::FailedToGetMessage(_)
            | AppError::SearchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        if status.is_server_error() {
            match std::error::Error::source(&self) {
                Some(source) => tracing::error!(error = %source, "{}", self),
                None => tracing::error!("{}", self),
            }
        }

        let body = Json(ErrorResponse {
            detail: self.to_string(),
        });

        (status, body).into_response()
    }
}
