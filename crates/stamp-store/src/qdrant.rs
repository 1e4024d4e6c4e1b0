//! Qdrant-backed [`PointStore`].
//!
//! All conversions between our json payloads and the Qdrant wire types live
//! here; nothing outside this module touches the qdrant-client API.
use std::collections::HashMap;
use std::future::Future;

use qdrant_client::qdrant::{
    point_id::PointIdOptions, vectors_output::VectorsOptions, Condition, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, PointId, PointStruct, PointsIdsList,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::point::{PayloadFilter, Point, PointStore, SearchHit, StoredPoint};
use crate::{BoxFuture, StoreError, RETRY_BACKOFF_MS};

pub struct QdrantStore {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore").finish_non_exhaustive()
    }
}

impl QdrantStore {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| StoreError::Backend(format!("qdrant client for {url}: {e}")))?;
        Ok(Self { client })
    }
}

/// Retry transient failures with the crate's bounded backoff schedule.
async fn retrying<T, F, Fut>(op: &str, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_BACKOFF_MS.len() => {
                let backoff = RETRY_BACKOFF_MS[attempt];
                attempt += 1;
                warn!(op, attempt, backoff_ms = backoff, error = %err, "retrying store call");
                sleep(Duration::from_millis(backoff)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn to_filter(filter: &PayloadFilter) -> Filter {
    Filter::all(
        filter
            .matches
            .iter()
            .map(|(key, value)| Condition::matches(key.clone(), value.clone())),
    )
}

fn to_payload(map: &Map<String, Value>) -> Result<Payload, StoreError> {
    Value::Object(map.clone())
        .try_into()
        .map_err(|e| StoreError::Decode(format!("payload encode: {e}")))
}

fn from_payload(payload: HashMap<String, qdrant_client::qdrant::Value>) -> Map<String, Value> {
    payload
        .into_iter()
        .map(|(key, value)| (key, Value::from(value)))
        .collect()
}

fn id_to_string(id: Option<PointId>) -> Option<String> {
    match id?.point_id_options? {
        PointIdOptions::Uuid(s) => Some(s),
        PointIdOptions::Num(n) => Some(n.to_string()),
    }
}

impl PointStore for QdrantStore {
    fn ensure_collection<'a>(
        &'a self,
        collection: &'a str,
        dimension: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let exists = self
                .client
                .collection_exists(collection)
                .await
                .map_err(|e| StoreError::Backend(format!("collection_exists: {e}")))?;
            if exists {
                return Ok(());
            }
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(collection)
                        .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
                )
                .await
                .map_err(|e| StoreError::Backend(format!("create_collection {collection}: {e}")))?;
            debug!(collection, dimension, "created collection");
            Ok(())
        })
    }

    fn drop_collection<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.client
                .delete_collection(collection)
                .await
                .map_err(|e| StoreError::Backend(format!("delete_collection {collection}: {e}")))?;
            Ok(())
        })
    }

    fn upsert<'a>(
        &'a self,
        collection: &'a str,
        points: Vec<Point>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let mut structs = Vec::with_capacity(points.len());
            for point in &points {
                structs.push(PointStruct::new(
                    point.id.clone(),
                    point.vector.clone(),
                    to_payload(&point.payload)?,
                ));
            }
            retrying("upsert", || {
                let structs = structs.clone();
                async move {
                    self.client
                        .upsert_points(UpsertPointsBuilder::new(collection, structs).wait(true))
                        .await
                        .map_err(|e| StoreError::Backend(format!("upsert {collection}: {e}")))?;
                    Ok(())
                }
            })
            .await
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
            let response = retrying("search", || {
                let mut builder =
                    SearchPointsBuilder::new(collection, vector.clone(), limit as u64)
                        .with_payload(true);
                if let Some(f) = &filter {
                    builder = builder.filter(to_filter(f));
                }
                async move {
                    self.client
                        .search_points(builder)
                        .await
                        .map_err(|e| StoreError::Backend(format!("search {collection}: {e}")))
                }
            })
            .await?;

            let hits = response
                .result
                .into_iter()
                .filter_map(|point| {
                    let id = id_to_string(point.id.clone())?;
                    Some(SearchHit {
                        id,
                        score: point.score,
                        payload: from_payload(point.payload),
                    })
                })
                .collect();
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
            let response = retrying("scroll", || {
                let mut builder = ScrollPointsBuilder::new(collection)
                    .limit(limit as u32)
                    .with_payload(true)
                    .with_vectors(true);
                if let Some(f) = &filter {
                    builder = builder.filter(to_filter(f));
                }
                async move {
                    self.client
                        .scroll(builder)
                        .await
                        .map_err(|e| StoreError::Backend(format!("scroll {collection}: {e}")))
                }
            })
            .await?;

            let points = response
                .result
                .into_iter()
                .filter_map(|point| {
                    let id = id_to_string(point.id.clone())?;
                    let vector = point.vectors.and_then(|v| match v.vectors_options {
                        Some(VectorsOptions::Vector(dense)) => Some(dense.data),
                        _ => None,
                    });
                    Some(StoredPoint {
                        id,
                        payload: from_payload(point.payload),
                        vector,
                    })
                })
                .collect();
            Ok(points)
        })
    }

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            let id_list = PointsIdsList {
                ids: ids.into_iter().map(PointId::from).collect(),
            };
            self.client
                .delete_points(
                    DeletePointsBuilder::new(collection)
                        .points(id_list)
                        .wait(true),
                )
                .await
                .map_err(|e| StoreError::Backend(format!("delete {collection}: {e}")))?;
            Ok(())
        })
    }
}
