//! Model-scored reordering of merged candidates.
//!
//! The stage rewrites `score` with the rerank model's output and records it
//! as `rerank_score`, but the retrieval-stage fields (sources, per-branch
//! scores and ranks, matched keywords, `initial_score`) ride along on the
//! same nodes and are never rebuilt or dropped.
use std::sync::Arc;

use stamp_core::{node::sort_by_score_desc, ScoredNode};
use stamp_store::RerankModel;
use tracing::{debug, instrument};

use crate::RagError;

#[derive(Debug)]
pub struct RerankStage {
    model: Arc<dyn RerankModel>,
    /// Candidates submitted to the model, taken from the top of the input.
    input_top_n: usize,
}

impl RerankStage {
    pub fn new(model: Arc<dyn RerankModel>, input_top_n: usize) -> Self {
        Self { model, input_top_n }
    }

    #[instrument(skip(self, query, candidates), fields(candidates = candidates.len(), top_n, threshold))]
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<ScoredNode>,
        top_n: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredNode>, RagError> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        sort_by_score_desc(&mut candidates);
        candidates.truncate(self.input_top_n);

        let passages: Vec<String> = candidates.iter().map(|n| n.node.text.clone()).collect();
        let scores = self.model.score(query, passages).await?;
        if scores.len() != candidates.len() {
            return Err(RagError::Search(format!(
                "rerank returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let mut kept: Vec<ScoredNode> = candidates
            .into_iter()
            .zip(scores)
            .filter_map(|(mut node, rerank_score)| {
                node.rerank_score = Some(rerank_score);
                node.score = rerank_score;
                (rerank_score >= threshold).then_some(node)
            })
            .collect();

        sort_by_score_desc(&mut kept);
        kept.truncate(top_n);
        debug!(kept = kept.len(), "rerank complete");
        Ok(kept)
    }
}
