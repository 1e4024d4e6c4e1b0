//! Errors for LLM interactions.
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Network connectivity or the HTTP request itself.
    #[error("network request failed: {message}")]
    Request {
        message: String,
        url: Option<String>,
        /// Hint for retry logic.
        is_timeout: bool,
    },

    /// The provider returned a non-success status, or embedded an error
    /// object in a 200 body.
    #[error("api error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        body_snippet: Option<String>,
    },

    #[error("unknown model id: {0}")]
    UnknownModel(String),

    #[error("missing api key: {0} is not set")]
    MissingApiKey(String),

    #[error("failed to deserialize response: {message}")]
    Deserialization {
        message: String,
        body_snippet: Option<String>,
    },

    #[error("llm call timed out")]
    Timeout,

    #[error("stream ended before any content")]
    EmptyStream,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Request { .. } => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Truncate large response bodies so error strings remain bounded.
pub(crate) fn truncate_for_error(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Preserve a little tail too (often contains the interesting part).
    let head: String = s.chars().take(max.saturating_sub(200)).collect();
    let tail_start = s.chars().count().saturating_sub(200);
    let tail: String = s.chars().skip(tail_start).collect();
    format!("{head}…<snip>…{tail}")
}
