//! Knowledge bases: hydration from the point store and node hygiene.
//!
//! A node's point payload stores the text and both excluded-keys lists under
//! sentinel-prefixed keys; every other payload key is user metadata and is
//! restored verbatim. Losing metadata here (file names in particular) shows
//! up later as unexplainably low rerank scores, so the round trip is strict.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use stamp_core::{Kb, Node, INTERNAL_KEY_PREFIX};
use stamp_store::PointStore;
use tracing::{debug, info};

use crate::bm25_index::KbBm25Index;
use crate::RagError;

const KEY_TEXT: &str = "_stamp_text";
const KEY_EXCLUDED_EMBED: &str = "_stamp_excluded_embed_keys";
const KEY_EXCLUDED_LLM: &str = "_stamp_excluded_llm_keys";

/// Points scanned per hydration scroll.
const SCROLL_PAGE: usize = 10_000;

pub fn node_to_payload(node: &Node) -> Map<String, Value> {
    let mut payload = node.metadata.clone();
    payload.insert(KEY_TEXT.into(), json!(node.text));
    payload.insert(
        KEY_EXCLUDED_EMBED.into(),
        json!(node.excluded_embed_metadata_keys),
    );
    payload.insert(
        KEY_EXCLUDED_LLM.into(),
        json!(node.excluded_llm_metadata_keys),
    );
    payload
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Rebuild a [`Node`] from a stored payload. Returns `None` when the payload
/// has no text (the point is not a node of ours).
pub fn node_from_payload(id: &str, payload: &Map<String, Value>) -> Option<Node> {
    let text = payload.get(KEY_TEXT)?.as_str()?.to_string();
    if text.is_empty() {
        return None;
    }
    let mut node = Node::new(id, text);
    node.excluded_embed_metadata_keys = string_list(payload.get(KEY_EXCLUDED_EMBED));
    node.excluded_llm_metadata_keys = string_list(payload.get(KEY_EXCLUDED_LLM));
    node.metadata = payload
        .iter()
        .filter(|(key, _)| !key.starts_with(INTERNAL_KEY_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(node)
}

/// One loaded KB: the node set plus its BM25 index. Read-only after load.
#[derive(Debug)]
pub struct KnowledgeBase {
    kb: Kb,
    nodes: HashMap<String, Node>,
    bm25: KbBm25Index,
}

impl KnowledgeBase {
    pub fn from_nodes(kb: Kb, nodes: Vec<Node>) -> Self {
        let corpus: Vec<(String, String)> = nodes
            .iter()
            .map(|n| (n.id.clone(), n.text.clone()))
            .collect();
        let bm25 = KbBm25Index::from_corpus(kb.collection(), corpus);
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self { kb, nodes, bm25 }
    }

    /// Load every node of `kb` from the store and build the BM25 index.
    pub async fn hydrate(store: &Arc<dyn PointStore>, kb: Kb) -> Result<Self, RagError> {
        let points = store.scroll(kb.collection(), None, SCROLL_PAGE).await?;
        let mut nodes = Vec::with_capacity(points.len());
        let mut undecodable = 0usize;
        for point in points {
            match node_from_payload(&point.id, &point.payload) {
                Some(node) => nodes.push(node),
                None => undecodable += 1,
            }
        }
        if undecodable > 0 {
            debug!(kb = kb.collection(), undecodable, "points without node payloads");
        }
        info!(kb = kb.collection(), nodes = nodes.len(), "hydrated knowledge base");
        Ok(Self::from_nodes(kb, nodes))
    }

    pub fn kb(&self) -> Kb {
        self.kb
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bm25(&self) -> &KbBm25Index {
        &self.bm25
    }
}
