//! stamp-store — clients for the services the pipeline leans on.
//!
//! - [`PointStore`]: the vector-store seam (Qdrant-shaped). Production uses
//!   [`QdrantStore`]; tests use the in-memory [`MemoryStore`].
//! - [`Embedder`] / [`RerankModel`]: HTTP clients for the embedding and
//!   rerank services, trait-fronted so the pipeline can be staged offline.
//! - [`KbManifest`]: the per-KB source-file digest sidecar that decides
//!   whether a collection must be rebuilt.
//!
//! All store calls retry transient failures with a short bounded backoff
//! before surfacing an error; callers decide whether to degrade or fail.

use std::future::Future;
use std::pin::Pin;

pub mod embed;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod point;
pub mod qdrant;
pub mod rerank;

pub use embed::{Embedder, HttpEmbedder};
pub use error::StoreError;
pub use manifest::KbManifest;
pub use memory::MemoryStore;
pub use point::{PayloadFilter, Point, PointStore, SearchHit, StoredPoint};
pub use qdrant::QdrantStore;
pub use rerank::{HttpReranker, RerankModel};

/// Boxed future alias used by the trait seams in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) const RETRY_BACKOFF_MS: [u64; 2] = [50, 100];
