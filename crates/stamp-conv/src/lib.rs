//! stamp-conv — per-session conversation memory.
//!
//! Turns live as points in the `conversations` collection, one per
//! user/assistant exchange, linked into a chain by `parent_turn_id`.
//! [`ConversationStore`] persists and recalls them (recently by timestamp,
//! relevantly by vector similarity within the session) and
//! [`messages::build_messages`] folds them into the LLM message list in a
//! fixed order.
//!
//! Writes are at-least-once with the turn id as the idempotency key; a lost
//! write costs one turn of memory, never a user-visible failure.

pub mod error;
pub mod messages;
pub mod store;
pub mod turn;

pub use error::ConvError;
pub use messages::{build_messages, MessageAssembly};
pub use store::ConversationStore;
pub use turn::{mint_session_id, session_owner, ConversationTurn, SessionOwner};
