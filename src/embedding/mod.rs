//! 向量生成
//!
//! 队列和消息接口只依赖 [`EmbeddingProvider`]；具体实现按配置选择：
//! 配置了 `EMBEDDING_API_URL` 时调用 OpenAI 兼容接口，否则使用本地哈希向量。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::CacheService;
use crate::config::Config;

mod hash;
mod http;

pub use hash::HashEmbedding;
pub use http::HttpEmbedding;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyInput,
    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embedding provider returned an unexpected response: {0}")]
    InvalidResponse(String),
    #[error("embedding provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync + 'static {
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn name(&self) -> &'static str;
}

pub type SharedEmbedder = Arc<dyn EmbeddingProvider>;

pub fn build_embedder(config: &Config) -> Result<SharedEmbedder, EmbeddingError> {
    match &config.embedding_api_url {
        Some(url) => {
            tracing::info!(
                url = url.as_str(),
                model = config.embedding_model.as_str(),
                timeout_secs = config.embedding_timeout().as_secs(),
                "embedding_http_provider_enabled"
            );
            Ok(Arc::new(HttpEmbedding::new(
                url.clone(),
                config.embedding_api_key.clone(),
                config.embedding_model.clone(),
                config.embedding_timeout(),
            )?))
        }
        None => {
            tracing::info!(dimensions = config.embedding_dimensions, "embedding_hash_provider_enabled");
            Ok(Arc::new(HashEmbedding::new(config.embedding_dimensions)))
        }
    }
}

/// 先查向量缓存，未命中时生成并写回
pub async fn embed_with_cache(
    provider: &dyn EmbeddingProvider,
    cache: &CacheService,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    let key = cache.embedding_key(text);
    if let Some(embedding) = cache.get::<Vec<f32>>(&key).await {
        tracing::debug!(provider = provider.name(), "embedding_cache_hit");
        return Ok(embedding);
    }

    let embedding = provider.generate(text).await?;
    cache
        .set(&key, &embedding, Some(cache.embedding_ttl()))
        .await;
    Ok(embedding)
}

/// 余弦相似度，维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn cached_embedding_skips_provider() {
        let cache = CacheService::new(
            Arc::new(crate::cache::MemoryCache::new(10)),
            &Config::default(),
        );
        let provider = HashEmbedding::new(8);
        let first = embed_with_cache(&provider, &cache, "hello world").await.unwrap();

        let key = cache.embedding_key("hello world");
        assert_eq!(cache.get::<Vec<f32>>(&key).await, Some(first.clone()));
        cache.set(&key, &vec![1.0f32], None).await;
        assert_eq!(
            embed_with_cache(&provider, &cache, "hello world").await.unwrap(),
            vec![1.0]
        );
    }

    #[test]
    fn hash_provider_is_default() {
        let embedder = build_embedder(&Config::default()).unwrap();
        assert_eq!(embedder.name(), "hash");

        let config = Config {
            embedding_api_url: Some("http://127.0.0.1:9".to_string()),
            ..Config::default()
        };
        assert_eq!(build_embedder(&config).unwrap().name(), "http");
    }
}
