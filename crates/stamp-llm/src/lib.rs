//! stamp-llm — streaming chat-completion client.
//!
//! Talks to OpenAI-shaped chat endpoints, pluggable per `model_id` via the
//! [`ProviderRegistry`]. Two call paths:
//! - [`LlmClient::complete`]: one-shot, returns assistant text (used by the
//!   intent router, decomposer, mini-answer and InsertBlock stages);
//! - [`LlmClient::stream`]: SSE deltas as [`LlmDelta`] values, keeping the
//!   provider's `reasoning_content` channel separate from `content` so the
//!   framer can emit THINK and CONTENT events without re-parsing.
//!
//! Providers sometimes embed errors in 200 bodies; both paths detect that
//! and surface it as [`LlmError::Api`].

pub mod client;
pub mod error;
pub mod registry;
pub mod wire;

pub use client::{LlmClient, LlmDelta, LlmStream};
pub use error::LlmError;
pub use registry::{ProviderEndpoint, ProviderRegistry};
pub use wire::{ChatMessage, ChatRequest, Role};
