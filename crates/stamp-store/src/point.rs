//! The vector-store seam: points, filters, and the [`PointStore`] trait.
use serde_json::{Map, Value};

use crate::{BoxFuture, StoreError};

/// A point to upsert: id, dense vector, free-form payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

/// A point returned from similarity search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// A point returned from a scroll (no similarity score).
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: String,
    pub payload: Map<String, Value>,
    pub vector: Option<Vec<f32>>,
}

/// Exact-match payload conditions, all of which must hold.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub matches: Vec<(String, String)>,
}

impl PayloadFilter {
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            matches: vec![(key.into(), value.into())],
        }
    }

    pub fn accepts(&self, payload: &Map<String, Value>) -> bool {
        self.matches.iter().all(|(key, expected)| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == expected)
        })
    }
}

/// Vector-store operations the pipeline needs. Collections are independent;
/// cosine similarity is assumed throughout.
pub trait PointStore: Send + Sync + std::fmt::Debug {
    fn ensure_collection<'a>(
        &'a self,
        collection: &'a str,
        dimension: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn drop_collection<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    fn upsert<'a>(
        &'a self,
        collection: &'a str,
        points: Vec<Point>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn search<'a>(
        &'a self,
        collection: &'a str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<PayloadFilter>,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>, StoreError>>;

    fn scroll<'a>(
        &'a self,
        collection: &'a str,
        filter: Option<PayloadFilter>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<StoredPoint>, StoreError>>;

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_string_payloads_only() {
        let filter = PayloadFilter::matching("session_id", "7_abc");
        let mut payload = Map::new();
        payload.insert("session_id".into(), json!("7_abc"));
        assert!(filter.accepts(&payload));

        payload.insert("session_id".into(), json!("8_def"));
        assert!(!filter.accepts(&payload));

        payload.insert("session_id".into(), json!(42));
        assert!(!filter.accepts(&payload));
    }
}
