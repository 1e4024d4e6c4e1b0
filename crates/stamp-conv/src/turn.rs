//! Persisted conversation turns and session-id handling.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ConvError;

/// One persisted user/assistant exchange.
///
/// `turn_id` doubles as the vector-store point id, which makes repeated
/// writes of the same turn idempotent. `parent_turn_id` links turns of a
/// session into a chain; the first turn carries `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: Uuid,
    pub parent_turn_id: Option<Uuid>,
    pub session_id: String,
    pub user_query: String,
    pub assistant_response: String,
    pub timestamp: DateTime<Utc>,
    /// File names cited in the answer.
    pub context_docs: Vec<String>,
    /// Approximate, for budget bookkeeping only.
    pub token_count: usize,
}

impl ConversationTurn {
    /// Text embedded for similarity recall.
    pub fn embed_text(&self) -> String {
        format!(
            "user: {}\nassistant: {}",
            self.user_query, self.assistant_response
        )
    }

    pub fn to_payload(&self) -> Result<Map<String, Value>, ConvError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ConvError::Decode("turn did not serialize to an object".into())),
            Err(e) => Err(ConvError::Decode(e.to_string())),
        }
    }

    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, ConvError> {
        serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| ConvError::Decode(e.to_string()))
    }
}

/// Who a session belongs to, parsed from the `{user_id}_{uuid}` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    User(i64),
    /// Prefix did not parse as an integer: a pre-migration session id.
    Legacy,
}

pub fn session_owner(session_id: &str) -> SessionOwner {
    session_id
        .split('_')
        .next()
        .and_then(|prefix| prefix.parse::<i64>().ok())
        .map_or(SessionOwner::Legacy, SessionOwner::User)
}

pub fn mint_session_id(user_id: i64) -> String {
    format!("{user_id}_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn() -> ConversationTurn {
        ConversationTurn {
            turn_id: Uuid::new_v4(),
            parent_turn_id: None,
            session_id: "7_abc".into(),
            user_query: "如何办理护照？".into(),
            assistant_response: "需要到出入境管理局申请。".into(),
            timestamp: Utc::now(),
            context_docs: vec!["passport.md".into()],
            token_count: 18,
        }
    }

    #[test]
    fn payload_round_trips() {
        let original = turn();
        let payload = original.to_payload().unwrap();
        let restored = ConversationTurn::from_payload(&payload).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn embed_text_concatenates_roles() {
        let t = turn();
        let text = t.embed_text();
        assert!(text.starts_with("user: 如何办理护照？"));
        assert!(text.contains("assistant: 需要"));
    }

    #[test]
    fn owner_parses_integer_prefix() {
        assert_eq!(session_owner("42_abc-def"), SessionOwner::User(42));
        assert_eq!(session_owner("guest_abc"), SessionOwner::Legacy);
        assert_eq!(session_owner(""), SessionOwner::Legacy);
    }

    #[test]
    fn minted_ids_carry_the_owner() {
        let id = mint_session_id(7);
        assert_eq!(session_owner(&id), SessionOwner::User(7));
    }
}
