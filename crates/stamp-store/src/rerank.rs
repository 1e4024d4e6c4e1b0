//! Rerank service client.
use serde::{Deserialize, Serialize};

use crate::{BoxFuture, StoreError};

/// Scores `(query, passage)` pairs; higher is more relevant. Results are
/// returned in the input passage order.
pub trait RerankModel: Send + Sync + std::fmt::Debug {
    fn score<'a>(
        &'a self,
        query: &'a str,
        passages: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<f32>, StoreError>>;
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankRow>,
}

#[derive(Debug, Deserialize)]
struct RerankRow {
    index: usize,
    relevance_score: f32,
}

/// Client for a cohere/xinference-shaped `/v1/rerank` endpoint.
#[derive(Debug, Clone)]
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpReranker {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
        }
    }
}

impl RerankModel for HttpReranker {
    fn score<'a>(
        &'a self,
        query: &'a str,
        passages: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<f32>, StoreError>> {
        Box::pin(async move {
            if passages.is_empty() {
                return Ok(Vec::new());
            }
            let request = RerankRequest {
                model: &self.model,
                query,
                documents: &passages,
            };
            let response = self
                .client
                .post(&self.url)
                .json(&request)
                .send()
                .await
                .map_err(|e| StoreError::Rerank(format!("sending to {}: {e}", self.url)))?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                let message = response.text().await.unwrap_or_default();
                return Err(StoreError::Api { status, message });
            }

            let parsed: RerankResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Rerank(format!("decoding response: {e}")))?;

            // The service returns rows sorted by relevance; restore input order.
            let mut scores = vec![0.0f32; passages.len()];
            for row in parsed.results {
                if row.index >= scores.len() {
                    return Err(StoreError::Rerank(format!(
                        "result index {} out of range for {} passages",
                        row.index,
                        scores.len()
                    )));
                }
                scores[row.index] = row.relevance_score;
            }
            Ok(scores)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn scores_are_restored_to_input_order() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/rerank");
            then.status(200).json_body(serde_json::json!({
                "results": [
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2}
                ]
            }));
        });

        let reranker = HttpReranker::new(server.url("/v1/rerank"), "bge-reranker-v2-m3");
        let scores = reranker
            .score("签证", vec!["甲".into(), "乙".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.2, 0.9]);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/rerank");
            then.status(200).json_body(serde_json::json!({
                "results": [{"index": 5, "relevance_score": 0.9}]
            }));
        });

        let reranker = HttpReranker::new(server.url("/v1/rerank"), "bge-reranker-v2-m3");
        let err = reranker.score("q", vec!["only".into()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Rerank(_)));
    }
}
