//! Error types for the store clients.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector store error: {0}")]
    Backend(String),

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("rerank service error: {0}")]
    Rerank(String),

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("manifest i/o error: {0}")]
    Manifest(#[from] std::io::Error),

    #[error("payload decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Transient failures are retried with bounded backoff inside the
    /// client; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Backend(_) | StoreError::Embedding(_) | StoreError::Rerank(_) => true,
            StoreError::Api { status, .. } => *status >= 500,
            StoreError::Manifest(_) | StoreError::Decode(_) => false,
        }
    }
}
