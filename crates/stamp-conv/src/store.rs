//! Conversation persistence over the shared point store.
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use stamp_core::{approx_tokens, config::ConversationSettings, CONVERSATIONS_COLLECTION};
use stamp_store::{Embedder, PayloadFilter, Point, PointStore};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::turn::ConversationTurn;
use crate::ConvError;

const RECENT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Points scanned per session when the cache misses.
const SESSION_SCROLL_CAP: usize = 100;
/// Points scanned per GC sweep.
const GC_SCROLL_CAP: usize = 10_000;

struct CacheEntry {
    /// All turns of the session, newest first.
    turns: Vec<ConversationTurn>,
    fetched_at: Instant,
}

pub struct ConversationStore {
    store: Arc<dyn PointStore>,
    embedder: Arc<dyn Embedder>,
    settings: ConversationSettings,
    recent_cache: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConversationStore {
    pub fn new(
        store: Arc<dyn PointStore>,
        embedder: Arc<dyn Embedder>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
            recent_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    /// Persist a completed exchange. The new turn's parent is the latest
    /// turn of the session unless an explicit parent is given, which must
    /// belong to the same session.
    #[instrument(skip_all, fields(session = session_id))]
    pub async fn add_turn(
        &self,
        session_id: &str,
        user_query: &str,
        assistant_response: &str,
        context_docs: Vec<String>,
        parent_override: Option<Uuid>,
    ) -> Result<Uuid, ConvError> {
        let session_turns = self.session_turns_desc(session_id).await?;
        let parent_turn_id = match parent_override {
            Some(parent) => {
                if !session_turns.iter().any(|t| t.turn_id == parent) {
                    return Err(ConvError::ForeignParent(parent));
                }
                Some(parent)
            }
            None => session_turns.first().map(|t| t.turn_id),
        };

        let turn = ConversationTurn {
            turn_id: Uuid::new_v4(),
            parent_turn_id,
            session_id: session_id.to_string(),
            user_query: user_query.to_string(),
            assistant_response: assistant_response.to_string(),
            timestamp: Utc::now(),
            context_docs,
            token_count: approx_tokens(user_query) + approx_tokens(assistant_response),
        };

        let vector = self
            .embedder
            .embed(vec![turn.embed_text()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConvError::Decode("embedder returned no vector for turn".into()))?;

        self.store
            .upsert(
                CONVERSATIONS_COLLECTION,
                vec![Point {
                    id: turn.turn_id.to_string(),
                    vector,
                    payload: turn.to_payload()?,
                }],
            )
            .await?;

        self.recent_cache
            .lock()
            .expect("recent cache lock")
            .remove(session_id);
        debug!(turn = %turn.turn_id, parent = ?turn.parent_turn_id, "turn persisted");
        Ok(turn.turn_id)
    }

    /// The last `n` turns of a session, oldest first.
    pub async fn recent(&self, session_id: &str, n: usize) -> Result<Vec<ConversationTurn>, ConvError> {
        let mut turns = self.session_turns_desc(session_id).await?;
        turns.truncate(n);
        turns.reverse();
        Ok(turns)
    }

    /// Turns of this session most similar to `query`, best first.
    pub async fn relevant(
        &self,
        session_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ConversationTurn>, ConvError> {
        let vector = self
            .embedder
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConvError::Decode("embedder returned no vector for query".into()))?;

        let hits = self
            .store
            .search(
                CONVERSATIONS_COLLECTION,
                vector,
                k,
                Some(PayloadFilter::matching("session_id", session_id)),
            )
            .await?;

        let mut turns = Vec::with_capacity(hits.len());
        for hit in hits {
            match ConversationTurn::from_payload(&hit.payload) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(point = %hit.id, error = %e, "undecodable turn payload"),
            }
        }
        Ok(turns)
    }

    /// Recent history as (user, assistant) pairs for prompt building.
    pub async fn history_pairs(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<(String, String)>, ConvError> {
        Ok(self
            .recent(session_id, n)
            .await?
            .into_iter()
            .map(|t| (t.user_query, t.assistant_response))
            .collect())
    }

    /// Delete every turn older than `expiry_days`; returns the count.
    #[instrument(skip(self))]
    pub async fn gc(&self, expiry_days: i64) -> Result<usize, ConvError> {
        let cutoff = Utc::now() - chrono::Duration::days(expiry_days);
        let points = self
            .store
            .scroll(CONVERSATIONS_COLLECTION, None, GC_SCROLL_CAP)
            .await?;

        let expired: Vec<String> = points
            .iter()
            .filter_map(|p| {
                let turn = ConversationTurn::from_payload(&p.payload).ok()?;
                (turn.timestamp < cutoff).then(|| p.id.clone())
            })
            .collect();
        let count = expired.len();
        if count > 0 {
            self.store.delete(CONVERSATIONS_COLLECTION, expired).await?;
        }
        self.recent_cache.lock().expect("recent cache lock").clear();
        debug!(count, "conversation gc complete");
        Ok(count)
    }

    /// All turns of a session, newest first, through the TTL cache.
    async fn session_turns_desc(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConversationTurn>, ConvError> {
        {
            let cache = self.recent_cache.lock().expect("recent cache lock");
            if let Some(entry) = cache.get(session_id) {
                if entry.fetched_at.elapsed() < RECENT_CACHE_TTL {
                    return Ok(entry.turns.clone());
                }
            }
        }

        let points = self
            .store
            .scroll(
                CONVERSATIONS_COLLECTION,
                Some(PayloadFilter::matching("session_id", session_id)),
                SESSION_SCROLL_CAP,
            )
            .await?;

        let mut turns = Vec::with_capacity(points.len());
        for point in points {
            match ConversationTurn::from_payload(&point.payload) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(point = %point.id, error = %e, "undecodable turn payload"),
            }
        }
        turns.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        self.recent_cache.lock().expect("recent cache lock").insert(
            session_id.to_string(),
            CacheEntry {
                turns: turns.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(turns)
    }
}
