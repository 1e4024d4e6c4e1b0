//! Error types for the retrieval pipeline.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("store error: {0}")]
    Store(#[from] stamp_store::StoreError),

    #[error("llm error: {0}")]
    Llm(#[from] stamp_llm::LlmError),

    #[error("search error: {0}")]
    Search(String),

    #[error("unknown knowledge base: {0}")]
    UnknownKb(String),

    #[error(
        "insert-block filter failed for most candidates \
         ({timeouts} timeouts, {errors} errors of {total})"
    )]
    InsertBlockCritical {
        timeouts: usize,
        errors: usize,
        total: usize,
    },
}
