//! Strategy-driven retrieval across several knowledge bases.
//!
//! Every non-general strategy consults the general KB as a safety net.
//! Merging takes a fixed slot
//! of the best unused nodes per KB, then fills the remaining quota from a
//! comparative pool across all consulted KBs, deduplicating by node id.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use stamp_core::{
    node::{score_desc_then_id, sort_by_score_desc},
    Kb, ScoredNode, Strategy,
};
use stamp_store::BoxFuture;
use tracing::{debug, instrument};

use crate::retriever::{HybridRetriever, Retriever};
use crate::RagError;

/// Nodes taken per consulted KB before the comparative pool.
const SLOT_SIZE: usize = 5;

/// Total returned nodes per strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategyCounts {
    pub general: usize,
    pub visa_free: usize,
    pub airline: usize,
    pub airline_visa_free: usize,
}

impl Default for StrategyCounts {
    fn default() -> Self {
        Self {
            general: 15,
            visa_free: 15,
            airline: 15,
            airline_visa_free: 20,
        }
    }
}

impl StrategyCounts {
    fn for_strategy(&self, strategy: Strategy) -> usize {
        match strategy {
            Strategy::General => self.general,
            Strategy::VisaFree => self.visa_free,
            Strategy::Airline => self.airline,
            Strategy::AirlineVisaFree => self.airline_visa_free,
        }
    }
}

#[derive(Debug)]
pub struct MultiKbRetriever {
    retrievers: HashMap<Kb, Arc<HybridRetriever>>,
    counts: StrategyCounts,
}

impl MultiKbRetriever {
    pub fn new(retrievers: HashMap<Kb, Arc<HybridRetriever>>, counts: StrategyCounts) -> Self {
        Self { retrievers, counts }
    }

    fn retriever(&self, kb: Kb) -> Result<&Arc<HybridRetriever>, RagError> {
        self.retrievers
            .get(&kb)
            .ok_or_else(|| RagError::UnknownKb(kb.collection().to_string()))
    }

    /// KBs a strategy can actually consult with the currently loaded set.
    /// Optional KBs may be feature-flagged off; the general KB must exist.
    fn loaded_kbs(&self, strategy: Strategy) -> Vec<Kb> {
        strategy
            .kbs()
            .iter()
            .copied()
            .filter(|kb| self.retrievers.contains_key(kb))
            .collect()
    }

    /// Retrieve for a strategy: per-KB hybrid retrieval, then quota merge.
    #[instrument(skip(self, query), fields(strategy = %strategy, query_len = query.chars().count()))]
    pub async fn retrieve_strategy(
        &self,
        strategy: Strategy,
        query: &str,
    ) -> Result<Vec<ScoredNode>, RagError> {
        let return_count = self.counts.for_strategy(strategy);

        if strategy == Strategy::General {
            let mut nodes = self.retriever(Kb::General)?.retrieve(query).await?;
            nodes.truncate(return_count);
            return Ok(nodes);
        }

        let kbs = self.loaded_kbs(strategy);
        let futures: Vec<_> = kbs
            .iter()
            .map(|kb| self.retriever(*kb))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|r| r.retrieve(query))
            .collect();
        let per_kb: Vec<Vec<ScoredNode>> = futures::future::try_join_all(futures).await?;

        let merged = merge_with_quotas(&kbs, per_kb, return_count);
        debug!(merged = merged.len(), "strategy merge complete");
        Ok(merged)
    }

    /// A `Retriever` view pinned to one strategy, for stages that fan out
    /// retrieval without knowing about routing.
    pub fn retriever_for(self: &Arc<Self>, strategy: Strategy) -> Arc<dyn Retriever> {
        Arc::new(StrategyRetriever {
            multi: Arc::clone(self),
            strategy,
        })
    }
}

/// Slot merge: for each KB in order take its best `SLOT_SIZE` unused nodes,
/// then fill up to `return_count` from the pooled remainder of all KBs.
/// First occurrence of a node id wins throughout.
fn merge_with_quotas(
    kbs: &[Kb],
    per_kb: Vec<Vec<ScoredNode>>,
    return_count: usize,
) -> Vec<ScoredNode> {
    let mut taken_ids: HashSet<String> = HashSet::new();
    let mut merged: Vec<ScoredNode> = Vec::with_capacity(return_count);
    let mut remainder: Vec<ScoredNode> = Vec::new();

    for (kb, mut nodes) in kbs.iter().zip(per_kb.into_iter()) {
        sort_by_score_desc(&mut nodes);
        let mut slot_used = 0usize;
        for node in nodes {
            if taken_ids.contains(node.id()) {
                continue;
            }
            if slot_used < SLOT_SIZE {
                taken_ids.insert(node.id().to_string());
                merged.push(node);
                slot_used += 1;
            } else {
                remainder.push(node);
            }
        }
        debug!(kb = %kb, slot_used, "kb slot filled");
    }

    // Comparative pool: best of whatever is left, regardless of origin.
    for node in remainder.into_iter().sorted_by(score_desc_then_id) {
        if merged.len() >= return_count {
            break;
        }
        if taken_ids.insert(node.id().to_string()) {
            merged.push(node);
        }
    }

    merged.truncate(return_count);
    sort_by_score_desc(&mut merged);
    merged
}

/// [`MultiKbRetriever`] pinned to a strategy.
#[derive(Debug)]
struct StrategyRetriever {
    multi: Arc<MultiKbRetriever>,
    strategy: Strategy,
}

impl Retriever for StrategyRetriever {
    fn retrieve<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Vec<ScoredNode>, RagError>> {
        Box::pin(self.multi.retrieve_strategy(self.strategy, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stamp_core::Node;

    fn scored(id: &str, score: f32) -> ScoredNode {
        ScoredNode::new(Node::new(id, format!("text {id}")), score)
    }

    fn batch(prefix: &str, count: usize, base: f32) -> Vec<ScoredNode> {
        (0..count)
            .map(|i| scored(&format!("{prefix}{i}"), base - i as f32 * 0.01))
            .collect()
    }

    #[test]
    fn slots_then_comparative_pool() {
        let kbs = [Kb::VisaFree, Kb::General];
        let merged = merge_with_quotas(
            &kbs,
            vec![batch("vf", 10, 0.9), batch("gen", 10, 0.8)],
            15,
        );
        assert_eq!(merged.len(), 15);
        // 5 from each slot, 5 comparative.
        let vf = merged.iter().filter(|n| n.id().starts_with("vf")).count();
        let gen = merged.iter().filter(|n| n.id().starts_with("gen")).count();
        assert!(vf >= 5, "visa_free slot filled: {vf}");
        assert!(gen >= 5, "general safety net filled: {gen}");
        // Comparative remainder is score-ordered: visa_free leftovers (0.85..)
        // outscore general leftovers (0.75..).
        assert_eq!(vf, 10);
        assert_eq!(gen, 5);
    }

    #[test]
    fn duplicate_ids_first_occurrence_wins() {
        let kbs = [Kb::VisaFree, Kb::General];
        let mut visa = batch("shared", 3, 0.9);
        visa.push(scored("only_vf", 0.5));
        let mut general = batch("shared", 3, 0.95);
        general.push(scored("only_gen", 0.4));

        let merged = merge_with_quotas(&kbs, vec![visa, general], 15);
        let ids: Vec<&str> = merged.iter().map(|n| n.id()).collect();
        let unique: HashSet<&&str> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "no duplicate ids: {ids:?}");
        assert!(ids.contains(&"only_vf"));
        assert!(ids.contains(&"only_gen"));
    }

    #[test]
    fn final_order_is_score_desc_across_kbs() {
        let kbs = [Kb::Airline, Kb::General];
        let merged = merge_with_quotas(
            &kbs,
            vec![batch("air", 5, 0.5), batch("gen", 5, 0.9)],
            10,
        );
        let scores: Vec<f32> = merged.iter().map(|n| n.score).collect();
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(scores, sorted);
        assert_eq!(merged[0].id(), "gen0");
    }

    #[test]
    fn general_candidates_always_present_when_available() {
        let kbs = [Kb::Airline, Kb::VisaFree, Kb::General];
        let merged = merge_with_quotas(
            &kbs,
            vec![batch("air", 20, 0.99), batch("vf", 20, 0.98), batch("gen", 1, 0.01)],
            20,
        );
        assert!(
            merged.iter().any(|n| n.id().starts_with("gen")),
            "general safety net missing"
        );
    }

    #[test]
    fn short_kbs_underfill_gracefully() {
        let kbs = [Kb::VisaFree, Kb::General];
        let merged = merge_with_quotas(&kbs, vec![batch("vf", 2, 0.9), vec![]], 15);
        assert_eq!(merged.len(), 2);
    }
}
