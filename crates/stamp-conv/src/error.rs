//! Error types for conversation persistence.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("store error: {0}")]
    Store(#[from] stamp_store::StoreError),

    #[error("turn payload decode error: {0}")]
    Decode(String),

    #[error("parent turn {0} does not belong to this session")]
    ForeignParent(uuid::Uuid),
}
