use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

use super::model::{CreateMessageRequest, ListMessagesQuery, MessageList};
use crate::AppState;
use crate::database::{MessageRecord, NewMessage};
use crate::embedding::embed_with_cache;
use crate::error::AppError;

/// 单次列表查询的上限
const MAX_LIST_LIMIT: usize = 200;

/// 写入消息
///
/// 异步模式下只保存为 `pending` 并唤醒队列，返回 202；
/// 否则当场生成向量，返回 200。两种情况都会让对应会话的检索缓存失效。
#[axum::debug_handler]
pub async fn create_message(
    State(state): State<AppState>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageRecord>), AppError> {
    req.validate()?;

    let async_mode = state.config.async_embeddings;
    let mut message = NewMessage::pending(
        req.tenant_id.as_str(),
        req.conversation_id.as_str(),
        req.role.as_str(),
        req.content.as_str(),
    );
    if let Some(metadata) = req.metadata {
        message = message.with_metadata(metadata);
    }

    if !async_mode {
        let result = embed_with_cache(state.embedder.as_ref(), &state.cache, &req.content)
            .await
            .map_err(|e| {
                tracing::warn!(tenant_id = req.tenant_id.as_str(), error = %e, "inline_embedding_failed");
                e.to_string()
            });
        message = message.with_embedding_result(result);
    }

    let record = state
        .repository
        .create(message)
        .await
        .map_err(AppError::FailedToStoreMessage)?;

    state
        .cache
        .invalidate_search(&record.tenant_id, Some(&record.conversation_id))
        .await;

    let status = if async_mode {
        state.jobs.notify();
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    state.metrics.record_message_ingested(
        &record.tenant_id,
        &record.role,
        async_mode,
        record.embedding_status.as_str(),
    );
    tracing::info!(
        message_id = %record.id,
        tenant_id = record.tenant_id.as_str(),
        conversation_id = record.conversation_id.as_str(),
        embedding_status = record.embedding_status.as_str(),
        "message_ingested"
    );

    Ok((status, Json(record)))
}

#[axum::debug_handler]
pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageRecord>, AppError> {
    state
        .repository
        .get(id)
        .await
        .map_err(AppError::FailedToGetMessage)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))
}

/// 租户下最近的消息，新的在前
#[axum::debug_handler]
pub async fn list_tenant_messages(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessageList<MessageRecord>>, AppError> {
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
    let items = state
        .repository
        .list_recent(&tenant_id, query.conversation_id.as_deref(), limit)
        .await
        .map_err(AppError::FailedToGetMessage)?;
    Ok(Json(MessageList {
        total: items.len(),
        items,
    }))
}
