//! Embedding service client.
use serde::{Deserialize, Serialize};

use crate::{BoxFuture, StoreError};

/// Vectorises text. The dense dimension is fixed at ingest time and the
/// serving side never inspects it.
pub trait Embedder: Send + Sync + std::fmt::Debug {
    fn embed<'a>(&'a self, texts: Vec<String>) -> BoxFuture<'a, Result<Vec<Vec<f32>>, StoreError>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// OpenAI-shaped `/v1/embeddings` client.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }

    async fn call(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, StoreError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: &texts,
        };
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Embedding(format!("sending to {}: {e}", self.url)))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api { status, message });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Embedding(format!("decoding response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(StoreError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

impl Embedder for HttpEmbedder {
    fn embed<'a>(&'a self, texts: Vec<String>) -> BoxFuture<'a, Result<Vec<Vec<f32>>, StoreError>> {
        Box::pin(async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            self.call(texts).await
        })
    }
}
