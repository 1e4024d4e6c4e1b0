//! stamp-rag — retrieval, routing, and context staging.
//!
//! The pipeline between an incoming question and the final LLM call:
//! - [`KnowledgeBase`]: hydrated nodes plus a CJK-aware BM25 index per KB.
//! - [`HybridRetriever`]: dense + BM25 per KB, fused by weighted RRF with a
//!   low-vector bypass ([`fusion::fuse_weighted_rrf`]).
//! - [`MultiKbRetriever`]: strategy-driven merging across KBs under fixed
//!   quotas, with the general KB as a safety net.
//! - [`RerankStage`]: model-scored reordering that carries retrieval
//!   metadata through untouched.
//! - [`IntentRouter`]: LLM classification with an LRU cache and a silent
//!   fall-back to the general strategy.
//! - [`Decomposer`]: fans complex queries out into sub-questions retrieved
//!   in parallel through the router-chosen retriever, generates per-sub
//!   mini-answers, and optionally synthesises them.
//! - [`InsertBlockFilter`]: per-node LLM relevance judging with bounded
//!   concurrency and per-call timeouts.
//!
//! The router, decomposer, and filter are silent degraders: their failures
//! reduce to the plain retrieval path and never fail the user request.

pub mod bm25_index;
pub mod decompose;
pub mod error;
pub mod fusion;
pub mod insert_block;
pub mod kb;
pub mod multi_kb;
pub mod prompts;
pub mod rerank_stage;
pub mod retriever;
pub mod router;
pub mod tokenize;

pub use bm25_index::KbBm25Index;
pub use decompose::{
    DecomposeMetrics, Decomposer, DecompositionMetadata, DecompositionOutcome, SubAnswer,
};
pub use error::RagError;
pub use fusion::{fuse_weighted_rrf, FusedHit, FusionConfig};
pub use insert_block::InsertBlockFilter;
pub use kb::{node_from_payload, node_to_payload, KnowledgeBase};
pub use multi_kb::{MultiKbRetriever, StrategyCounts};
pub use rerank_stage::RerankStage;
pub use retriever::{HybridConfig, HybridRetriever, Retriever};
pub use router::IntentRouter;
pub use tokenize::CjkTokenizer;
