//! Indexed text chunks and their per-request retrieval state.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload keys starting with this prefix are internal bookkeeping and are
/// not restored into [`Node::metadata`] when hydrating from the store.
pub const INTERNAL_KEY_PREFIX: &str = "_stamp_";

/// An indexed text chunk. Created at ingestion, read-only at serve time.
///
/// The same `text` string is used for dense embedding and BM25 tokenisation;
/// `id` is unique within a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Metadata keys excluded when building the embedding input.
    #[serde(default)]
    pub excluded_embed_metadata_keys: Vec<String>,
    /// Metadata keys excluded when rendering context for the LLM.
    #[serde(default)]
    pub excluded_llm_metadata_keys: Vec<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Map::new(),
            embedding: None,
            excluded_embed_metadata_keys: Vec::new(),
            excluded_llm_metadata_keys: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Source file name recorded at ingestion, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.metadata.get("file_name").and_then(Value::as_str)
    }
}

/// Which retriever branch produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Keyword,
}

/// Outcome of the per-node relevance judgement (InsertBlock filter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockVerdict {
    pub can_answer: bool,
    pub key_passage: String,
    pub reasoning: String,
}

/// A [`Node`] with its retrieval provenance for one request.
///
/// `score` is the current pipeline score and is rewritten by later stages
/// (fusion, rerank); `initial_score` and the per-branch fields are set once
/// by the hybrid retriever and carried through unchanged.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
    pub initial_score: f32,
    pub sources: Vec<RetrievalSource>,
    pub vector_score: f32,
    pub bm25_score: f32,
    pub vector_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
    pub matched_keywords: Option<Vec<String>>,
    pub rerank_score: Option<f32>,
    pub verdict: Option<BlockVerdict>,
}

impl ScoredNode {
    pub fn new(node: Node, score: f32) -> Self {
        Self {
            node,
            score,
            initial_score: score,
            sources: Vec::new(),
            vector_score: 0.0,
            bm25_score: 0.0,
            vector_rank: None,
            bm25_rank: None,
            matched_keywords: None,
            rerank_score: None,
            verdict: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn found_by(&self, source: RetrievalSource) -> bool {
        self.sources.contains(&source)
    }
}

/// Score descending with node-id ascending tie-break, so equal scores
/// produce a deterministic order.
pub fn score_desc_then_id(a: &ScoredNode, b: &ScoredNode) -> std::cmp::Ordering {
    match b
        .score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
    {
        std::cmp::Ordering::Equal => a.node.id.cmp(&b.node.id),
        other => other,
    }
}

pub fn sort_by_score_desc(nodes: &mut [ScoredNode]) {
    nodes.sort_by(score_desc_then_id);
}
