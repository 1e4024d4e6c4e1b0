//! Server-side error type.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session does not belong to the caller")]
    SessionOwnership,

    #[error("pipeline error: {0}")]
    Rag(#[from] stamp_rag::RagError),

    #[error("conversation error: {0}")]
    Conv(#[from] stamp_conv::ConvError),

    #[error("llm error: {0}")]
    Llm(#[from] stamp_llm::LlmError),

    #[error("client disconnected")]
    Cancelled,
}
