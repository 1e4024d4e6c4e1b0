//! Knowledge-context rendering and SOURCE event payloads.
use serde_json::{json, Value};
use stamp_core::ScoredNode;

/// Render accepted nodes as numbered blocks with their source labels.
/// `rules` (when present) lead the context under their own heading and are
/// not numbered with the regular material.
pub fn build_knowledge_context(nodes: &[ScoredNode], rules: &[ScoredNode]) -> String {
    let mut out = String::new();
    if !rules.is_empty() {
        out.push_str("适用规则：\n");
        for rule in rules {
            out.push_str(&format!("- {}\n", rule.node.text.trim()));
        }
        out.push('\n');
    }
    for (i, node) in nodes.iter().enumerate() {
        let label = node.node.file_name().unwrap_or("未知来源");
        out.push_str(&format!("【资料{}】来源：{}\n{}\n\n", i + 1, label, node.node.text.trim()));
    }
    out.trim_end().to_string()
}

/// The JSON payload of one `SOURCE:` event.
pub fn source_payload(node: &ScoredNode) -> Value {
    let mut payload = json!({
        "id": node.node.id,
        "fileName": node.node.file_name().unwrap_or_default(),
        "initialScore": node.initial_score,
        "rerankedScore": node.rerank_score,
        "content": node.node.text,
        "retrievalSources": node.sources,
        "vectorScore": node.vector_score,
        "bm25Score": node.bm25_score,
    });
    let map = payload.as_object_mut().expect("source payload is an object");
    if let Some(rank) = node.vector_rank {
        map.insert("vectorRank".into(), json!(rank));
    }
    if let Some(rank) = node.bm25_rank {
        map.insert("bm25Rank".into(), json!(rank));
    }
    if let Some(keywords) = &node.matched_keywords {
        map.insert("matchedKeywords".into(), json!(keywords));
    }
    if let Some(verdict) = &node.verdict {
        map.insert("canAnswer".into(), json!(verdict.can_answer));
        map.insert("keyPassage".into(), json!(verdict.key_passage));
        map.insert("reasoning".into(), json!(verdict.reasoning));
    }
    payload
}
