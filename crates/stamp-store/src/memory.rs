//! In-memory [`PointStore`] used to stage the pipeline in tests.
//!
//! Brute-force cosine scan over per-collection point lists; insertion order
//! is preserved so scroll results are deterministic.
use std::collections::HashMap;
use std::sync::Mutex;

use crate::point::{PayloadFilter, Point, PointStore, SearchHit, StoredPoint};
use crate::{BoxFuture, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Point>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .expect("memory store lock")
            .get(collection)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl PointStore for MemoryStore {
    fn ensure_collection<'a>(
        &'a self,
        collection: &'a str,
        _dimension: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.collections
                .lock()
                .expect("memory store lock")
                .entry(collection.to_string())
                .or_default();
            Ok(())
        })
    }

    fn drop_collection<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.collections
                .lock()
                .expect("memory store lock")
                .remove(collection);
            Ok(())
        })
    }

    fn upsert<'a>(
        &'a self,
        collection: &'a str,
        points: Vec<Point>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().expect("memory store lock");
            let existing = collections.entry(collection.to_string()).or_default();
            for point in points {
                match existing.iter_mut().find(|p| p.id == point.id) {
                    Some(slot) => *slot = point,
                    None => existing.push(point),
                }
            }
            Ok(())
        })
    }

    fn search<'a>(
        &'a self,
        collection: &'a str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<PayloadFilter>,
    ) -> BoxFuture<'a, Result<Vec<SearchHit>, StoreError>> {
        Box::pin(async move {
            let collections = self.collections.lock().expect("memory store lock");
            let mut hits: Vec<SearchHit> = collections
                .get(collection)
                .map(|points| {
                    points
                        .iter()
                        .filter(|p| filter.as_ref().is_none_or(|f| f.accepts(&p.payload)))
                        .map(|p| SearchHit {
                            id: p.id.clone(),
                            score: cosine(&vector, &p.vector),
                            payload: p.payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by(|a, b| {
                match b
                    .score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                {
                    std::cmp::Ordering::Equal => a.id.cmp(&b.id),
                    other => other,
                }
            });
            hits.truncate(limit);
            Ok(hits)
        })
    }

    fn scroll<'a>(
        &'a self,
        collection: &'a str,
        filter: Option<PayloadFilter>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<StoredPoint>, StoreError>> {
        Box::pin(async move {
            let collections = self.collections.lock().expect("memory store lock");
            let points = collections
                .get(collection)
                .map(|points| {
                    points
                        .iter()
                        .filter(|p| filter.as_ref().is_none_or(|f| f.accepts(&p.payload)))
                        .take(limit)
                        .map(|p| StoredPoint {
                            id: p.id.clone(),
                            payload: p.payload.clone(),
                            vector: Some(p.vector.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(points)
        })
    }

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().expect("memory store lock");
            if let Some(points) = collections.get_mut(collection) {
                points.retain(|p| !ids.contains(&p.id));
            }
            Ok(())
        })
    }
}
