//! Chat-completion client: one-shot and streaming paths.
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::truncate_for_error;
use crate::registry::ProviderRegistry;
use crate::wire::{ChatMessage, ChatRequest, ChatResponse};
use crate::LlmError;

/// One streaming chunk with the reasoning channel kept separate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmDelta, LlmError>> + Send>>;

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    registry: ProviderRegistry,
    request_timeout: Duration,
    max_tokens: u32,
    max_retries: usize,
}

impl LlmClient {
    pub fn new(
        registry: ProviderRegistry,
        request_timeout: Duration,
        max_tokens: u32,
        max_retries: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            request_timeout,
            max_tokens,
            max_retries,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn build_request(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        stream: bool,
        enable_thinking: Option<bool>,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages,
            stream,
            max_tokens: Some(self.max_tokens),
            temperature: None,
            enable_thinking,
        }
    }

    /// One-shot completion; returns the assistant text of the first choice.
    /// Retryable failures are retried up to the configured limit.
    pub async fn complete(
        &self,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> Result<String, LlmError> {
        let endpoint = self.registry.resolve(model_id)?;
        let api_key = endpoint.resolve_api_key()?;
        let request = self.build_request(&endpoint.model, messages, false, None);

        let mut attempt = 0usize;
        loop {
            match self
                .send_once(&endpoint.completion_url, api_key.as_deref(), &request)
                .await
            {
                Ok(body) => return parse_completion(&body),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "retrying llm completion");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        api_key: Option<&str>,
        request: &ChatRequest,
    ) -> Result<String, LlmError> {
        let mut builder = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(request)
            .timeout(self.request_timeout);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| LlmError::Request {
            message: format!("sending request to {url}: {e}"),
            url: Some(url.to_string()),
            is_timeout: e.is_timeout(),
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| LlmError::Request {
            message: format!("reading response body (status {status}): {e}"),
            url: Some(url.to_string()),
            is_timeout: e.is_timeout(),
        })?;

        if !(200..300).contains(&status) {
            return Err(LlmError::Api {
                status,
                message: truncate_for_error(&body, 1_024),
                body_snippet: Some(truncate_for_error(&body, 4_096)),
            });
        }
        Ok(body)
    }

    /// Open a streaming completion. The returned stream yields deltas until
    /// the provider sends `[DONE]` or the connection ends; dropping the
    /// stream aborts the underlying request.
    pub async fn stream(
        &self,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        enable_thinking: bool,
    ) -> Result<LlmStream, LlmError> {
        let endpoint = self.registry.resolve(model_id)?;
        let api_key = endpoint.resolve_api_key()?;
        let request = self.build_request(
            &endpoint.model,
            messages,
            true,
            enable_thinking.then_some(true),
        );
        let url = endpoint.completion_url.clone();

        let mut builder = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request)
            .timeout(self.request_timeout);
        if let Some(key) = &api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| LlmError::Request {
            message: format!("opening stream to {url}: {e}"),
            url: Some(url.clone()),
            is_timeout: e.is_timeout(),
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: truncate_for_error(&body, 1_024),
                body_snippet: Some(truncate_for_error(&body, 4_096)),
            });
        }

        let (tx, rx) = mpsc::channel::<Result<LlmDelta, LlmError>>(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Request {
                                message: format!("stream read: {e}"),
                                url: Some(url.clone()),
                                is_timeout: e.is_timeout(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    match parse_sse_line(line.trim()) {
                        SseLine::Done => break 'outer,
                        SseLine::Skip => {}
                        SseLine::Delta(delta) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                // Receiver dropped: the request was cancelled.
                                return;
                            }
                        }
                        SseLine::Error(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
            debug!("llm stream closed");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

enum SseLine {
    Delta(LlmDelta),
    Done,
    Skip,
    Error(LlmError),
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        // Comments, keep-alives, event names, blank separators.
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    if data.is_empty() {
        return SseLine::Skip;
    }
    if let Some(err) = embedded_error(data) {
        return SseLine::Error(err);
    }
    match serde_json::from_str::<ChatResponse>(data) {
        Ok(response) => {
            let delta = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .map(|d| LlmDelta {
                    content: d.content.filter(|s| !s.is_empty()),
                    reasoning: d.reasoning_content.filter(|s| !s.is_empty()),
                })
                .unwrap_or_default();
            SseLine::Delta(delta)
        }
        Err(e) => SseLine::Error(LlmError::Deserialization {
            message: format!("stream chunk: {e}"),
            body_snippet: Some(truncate_for_error(data, 512)),
        }),
    }
}

/// Providers sometimes return `{ "error": ... }` inside a 200 body.
fn embedded_error(body: &str) -> Option<LlmError> {
    let value: Value = serde_json::from_str(body).ok()?;
    let err = value.get("error")?;
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown provider error")
        .to_string();
    let status = err.get("status").and_then(Value::as_u64).unwrap_or(200) as u16;
    Some(LlmError::Api {
        status,
        message,
        body_snippet: Some(truncate_for_error(body, 1_024)),
    })
}

fn parse_completion(body: &str) -> Result<String, LlmError> {
    if let Some(err) = embedded_error(body) {
        return Err(err);
    }
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Deserialization {
            message: format!("{e}"),
            body_snippet: Some(truncate_for_error(body, 2_000)),
        })?;

    for choice in parsed.choices {
        if let Some(message) = choice.message {
            if let Some(text) = message.content {
                return Ok(text);
            }
        }
    }
    Err(LlmError::Deserialization {
        message: "no usable choice in response".into(),
        body_snippet: Some(truncate_for_error(body, 512)),
    })
}
