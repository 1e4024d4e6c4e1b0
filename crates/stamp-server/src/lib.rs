//! stamp-server — HTTP surface and request orchestration.
//!
//! Routes:
//! - `POST /api/knowledge_chat` — single-turn streaming QA.
//! - `POST /api/knowledge_chat_conversation` — multi-turn, with per-session
//!   history folded into the prompt.
//!
//! Both reply as `text/event-stream` with `SESSION`/`CONTENT`/`THINK`/
//! `SOURCE`/`ERROR`/`DONE` frames. The pipeline itself lives in
//! [`pipeline::run_chat`] and is exercised directly by the integration
//! tests, with the HTTP layer as a thin bridge.

pub mod auth;
pub mod context;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod sse;
pub mod state;

pub use auth::{AuthService, AuthVerdict, HttpAuthClient, StaticAuth};
pub use error::ServerError;
pub use pipeline::{run_chat, AppState, ChatRequestBody};
pub use sse::{Frame, ThinkDemux};
pub use state::build_state;
