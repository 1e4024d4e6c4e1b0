//! The retriever seam and the per-KB hybrid retriever.
use std::sync::Arc;

use stamp_core::{RetrievalSource, ScoredNode};
use stamp_store::{BoxFuture, Embedder, PointStore};
use tracing::{debug, instrument};

use crate::fusion::{fuse_weighted_rrf, FusionConfig};
use crate::kb::KnowledgeBase;
use crate::tokenize::CjkTokenizer;
use crate::RagError;

/// Anything that turns a query into an ordered candidate list. The routing
/// layer picks a concrete retriever per strategy and passes it down; the
/// decomposer never constructs its own.
pub trait Retriever: Send + Sync + std::fmt::Debug {
    fn retrieve<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Vec<ScoredNode>, RagError>>;
}

#[derive(Debug, Clone, Copy)]
pub struct HybridConfig {
    pub fusion: FusionConfig,
    /// Dense branch depth.
    pub top_k_vector: usize,
    /// BM25 branch depth.
    pub top_k_bm25: usize,
    /// Cap on the fused result.
    pub top_k_merged: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            top_k_vector: 30,
            top_k_bm25: 30,
            top_k_merged: 30,
        }
    }
}

/// Dense + BM25 retrieval over one knowledge base, fused by weighted RRF
/// with the low-vector bypass.
#[derive(Debug)]
pub struct HybridRetriever {
    kb: Arc<KnowledgeBase>,
    store: Arc<dyn PointStore>,
    embedder: Arc<dyn Embedder>,
    cfg: HybridConfig,
}

impl HybridRetriever {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        store: Arc<dyn PointStore>,
        embedder: Arc<dyn Embedder>,
        cfg: HybridConfig,
    ) -> Self {
        Self {
            kb,
            store,
            embedder,
            cfg,
        }
    }

    pub fn kb(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    #[instrument(skip(self, query), fields(kb = %self.kb.kb(), query_len = query.chars().count()))]
    async fn retrieve_inner(&self, query: &str) -> Result<Vec<ScoredNode>, RagError> {
        if self.kb.is_empty() {
            debug!("knowledge base empty; nothing to retrieve");
            return Ok(Vec::new());
        }

        // Dense branch: embed the query, nearest-neighbour in the store.
        let embeddings = self.embedder.embed(vec![query.to_string()]).await?;
        let query_vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Search("embedder returned no vector for query".into()))?;
        let dense_hits = self
            .store
            .search(
                self.kb.kb().collection(),
                query_vector,
                self.cfg.top_k_vector,
                None,
            )
            .await?;
        let vector_list: Vec<(String, f32)> = dense_hits
            .into_iter()
            .map(|hit| (hit.id, hit.score))
            .collect();

        // BM25 branch: in-memory, synchronous.
        let bm25_list = self.kb.bm25().search(query, self.cfg.top_k_bm25);

        let fused = fuse_weighted_rrf(&vector_list, &bm25_list, &self.cfg.fusion);
        debug!(
            dense = vector_list.len(),
            bm25 = bm25_list.len(),
            fused = fused.len(),
            "hybrid branches fused"
        );

        let mut out = Vec::with_capacity(fused.len().min(self.cfg.top_k_merged));
        for hit in fused.into_iter().take(self.cfg.top_k_merged) {
            // Hits whose node is gone from the loaded KB (reingest race) are
            // dropped rather than served with an empty body.
            let Some(node) = self.kb.get(&hit.id) else {
                debug!(id = %hit.id, "fused hit has no loaded node; dropping");
                continue;
            };
            let matched = if hit.sources.contains(&RetrievalSource::Keyword) {
                Some(CjkTokenizer::matched_keywords(query, &node.text))
            } else {
                None
            };
            let mut scored = ScoredNode::new(node.clone(), hit.score);
            scored.sources = hit.sources;
            scored.vector_score = hit.vector_score;
            scored.bm25_score = hit.bm25_score;
            scored.vector_rank = hit.vector_rank;
            scored.bm25_rank = hit.bm25_rank;
            scored.matched_keywords = matched;
            out.push(scored);
        }
        Ok(out)
    }
}

impl Retriever for HybridRetriever {
    fn retrieve<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Vec<ScoredNode>, RagError>> {
        Box::pin(self.retrieve_inner(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stamp_core::{Kb, Node};
    use stamp_store::{MemoryStore, Point, StoreError};

    /// Deterministic embedder: maps known phrases to fixed unit vectors.
    #[derive(Debug)]
    pub(crate) struct StubEmbedder {
        pub table: Vec<(&'static str, Vec<f32>)>,
        pub fallback: Vec<f32>,
    }

    impl Embedder for StubEmbedder {
        fn embed<'a>(
            &'a self,
            texts: Vec<String>,
        ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, StoreError>> {
            Box::pin(async move {
                Ok(texts
                    .iter()
                    .map(|t| {
                        self.table
                            .iter()
                            .find(|(phrase, _)| t.contains(phrase))
                            .map(|(_, v)| v.clone())
                            .unwrap_or_else(|| self.fallback.clone())
                    })
                    .collect())
            })
        }
    }

    async fn seeded_store(nodes: &[(&str, &str, Vec<f32>)]) -> Arc<dyn PointStore> {
        let store = MemoryStore::new();
        let points: Vec<Point> = nodes
            .iter()
            .map(|(id, text, vector)| Point {
                id: id.to_string(),
                vector: vector.clone(),
                payload: crate::kb::node_to_payload(&Node::new(*id, *text)),
            })
            .collect();
        store.upsert(Kb::General.collection(), points).await.unwrap();
        Arc::new(store)
    }

    fn kb_from(nodes: &[(&str, &str)]) -> Arc<KnowledgeBase> {
        Arc::new(KnowledgeBase::from_nodes(
            Kb::General,
            nodes
                .iter()
                .map(|(id, text)| Node::new(*id, *text))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn hybrid_tags_sources_and_keywords() {
        let store = seeded_store(&[
            ("a", "护照办理流程", vec![1.0, 0.0]),
            ("b", "泰国免签政策", vec![0.0, 1.0]),
        ])
        .await;
        let kb = kb_from(&[("a", "护照办理流程"), ("b", "泰国免签政策")]);
        let embedder = Arc::new(StubEmbedder {
            table: vec![("免签", vec![0.0, 1.0])],
            fallback: vec![1.0, 0.0],
        });
        let retriever = HybridRetriever::new(kb, store, embedder, HybridConfig::default());

        let results = retriever.retrieve("泰国免签").await.unwrap();
        assert!(!results.is_empty());
        let top = &results[0];
        assert_eq!(top.id(), "b");
        assert!(top.found_by(RetrievalSource::Vector));
        assert!(top.found_by(RetrievalSource::Keyword));
        let matched = top.matched_keywords.as_ref().unwrap();
        assert!(matched.contains(&"免签".to_string()));
        assert!(top.initial_score > 0.0);
    }

    #[tokio::test]
    async fn bm25_only_match_survives_uninformative_dense_scores() {
        // Both stored vectors are orthogonal to the query embedding, so the
        // dense branch scores ~0 and the BM25 magnitude must decide.
        let store = seeded_store(&[
            ("a", "JS0 扣减次数说明 详细", vec![0.0, 1.0]),
            ("b", "JS0 扣减规则", vec![0.0, 1.0]),
        ])
        .await;
        let kb = kb_from(&[("a", "JS0 扣减次数说明 详细"), ("b", "JS0 扣减规则")]);
        let embedder = Arc::new(StubEmbedder {
            table: vec![],
            fallback: vec![1.0, 0.0],
        });
        let retriever = HybridRetriever::new(kb, store, embedder, HybridConfig::default());

        let results = retriever.retrieve("JS0 扣减次数").await.unwrap();
        assert!(results.len() >= 2);
        // "a" carries more matching terms, so its BM25 magnitude wins.
        assert_eq!(results[0].id(), "a");
        assert!(results[0].bm25_score > results[1].bm25_score);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn empty_kb_retrieves_empty() {
        let store: Arc<dyn PointStore> = Arc::new(MemoryStore::new());
        let kb = kb_from(&[]);
        let embedder = Arc::new(StubEmbedder {
            table: vec![],
            fallback: vec![1.0],
        });
        let retriever = HybridRetriever::new(kb, store, embedder, HybridConfig::default());
        assert!(retriever.retrieve("任何问题").await.unwrap().is_empty());
    }
}
