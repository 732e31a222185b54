use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};

/// OpenAI 兼容的 `/embeddings` 接口
#[derive(Debug, Clone)]
pub struct HttpEmbedding {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedding {
    /// `timeout` 覆盖连接、发送到读完响应体的整个请求
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider(format!("{}: {}", status, body)));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding in response".to_string()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn embedder(base_url: &str, timeout: Duration) -> HttpEmbedding {
        HttpEmbedding::new(base_url.to_string(), None, "m".to_string(), timeout).unwrap()
    }

    #[test]
    fn endpoint_joins_base_url() {
        let embedder = embedder("https://api.example.com/v1/", Duration::from_secs(30));
        assert_eq!(embedder.endpoint(), "https://api.example.com/v1/embeddings");
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let embedder = embedder("http://127.0.0.1:1", Duration::from_secs(30));
        assert!(matches!(
            embedder.generate("   ").await,
            Err(EmbeddingError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn stalled_provider_times_out() {
        // 接受连接但从不响应
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let embedder = embedder(&format!("http://{}", addr), Duration::from_millis(200));
        let started = Instant::now();
        let result = embedder.generate("hello").await;
        assert!(matches!(result, Err(EmbeddingError::Request(ref e)) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
