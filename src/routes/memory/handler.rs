use std::cmp::Ordering;
use std::time::Instant;

use axum::extract::{Json, Query, State};

use super::model::{SearchHit, SearchQuery, SearchResponse};
use crate::AppState;
use crate::database::{EmbeddingStatus, MessageRecord};
use crate::embedding::{cosine_similarity, embed_with_cache};
use crate::error::AppError;

/// 语义检索
///
/// 在租户（可选会话）最近的 `candidate_limit` 条已完成消息中按余弦相似度取前 `top_k` 条，
/// 结果写入检索缓存，新消息写入时失效。
#[axum::debug_handler]
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    params.validate()?;
    let started = Instant::now();
    let conversation = params.conversation();

    let key = state.cache.search_key(
        &params.tenant_id,
        conversation,
        &params.query,
        params.top_k,
        params.candidate_limit,
    );
    if let Some(mut hit) = state.cache.get::<SearchResponse>(&key).await {
        hit.cached = true;
        state
            .metrics
            .record_memory_search(&params.tenant_id, hit.total, true, started.elapsed());
        return Ok(Json(hit));
    }

    let query_embedding = embed_with_cache(state.embedder.as_ref(), &state.cache, &params.query)
        .await
        .map_err(|e| AppError::Unavailable(format!("embedding provider failed: {}", e)))?;

    let candidates = state
        .repository
        .list_recent(&params.tenant_id, conversation, params.candidate_limit as usize)
        .await
        .map_err(AppError::SearchFailed)?;

    let results = rank(&query_embedding, candidates, params.top_k as usize);
    let response = SearchResponse {
        total: results.len(),
        cached: false,
        results,
    };
    state.cache.set(&key, &response, None).await;

    state
        .metrics
        .record_memory_search(&params.tenant_id, response.total, false, started.elapsed());
    tracing::debug!(
        tenant_id = params.tenant_id.as_str(),
        conversation_id = conversation,
        total = response.total,
        "memory_search_completed"
    );
    Ok(Json(response))
}

fn rank(query: &[f32], candidates: Vec<MessageRecord>, top_k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = candidates
        .into_iter()
        .filter(|m| m.embedding_status == EmbeddingStatus::Completed)
        .filter_map(|m| {
            let score = cosine_similarity(query, m.embedding.as_deref()?);
            Some(SearchHit {
                id: m.id,
                conversation_id: m.conversation_id,
                role: m.role,
                content: m.content,
                score,
            })
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewMessage;

    fn completed(content: &str, embedding: Vec<f32>) -> MessageRecord {
        NewMessage::pending("t", "c", "user", content)
            .with_embedding_result(Ok(embedding))
            .into_record()
    }

    #[test]
    fn rank_orders_by_score_and_skips_unembedded() {
        let pending = NewMessage::pending("t", "c", "user", "pending").into_record();
        let candidates = vec![
            completed("far", vec![0.0, 1.0]),
            pending,
            completed("near", vec![1.0, 0.1]),
            completed("exact", vec![1.0, 0.0]),
        ];

        let hits = rank(&[1.0, 0.0], candidates, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "exact");
        assert_eq!(hits[1].content, "near");
    }
}
