//! Weighted reciprocal-rank fusion with a low-vector-score bypass.
//!
//! Plain RRF ranks by reciprocal rank alone, which inverts the expected
//! order when the dense branch returns near-zero similarities: two nodes
//! found only by BM25 would be ordered by their (meaningless) insertion
//! ranks instead of their BM25 magnitudes. The bypass scores such nodes by
//! `w_b * bm25_score` directly, preserving BM25 ordering, while nodes with
//! an informative dense signal keep the usual weighted-RRF formula.
use std::collections::HashMap;

use stamp_core::RetrievalSource;

/// Dense scores at or below this are treated as uninformative.
pub const VECTOR_SCORE_FLOOR: f32 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// RRF smoothing constant.
    pub k: f32,
    pub vector_weight: f32,
    pub bm25_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: 10.0,
            vector_weight: 0.7,
            bm25_weight: 0.3,
        }
    }
}

/// One fused candidate with its per-branch provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f32,
    pub sources: Vec<RetrievalSource>,
    pub vector_score: f32,
    pub bm25_score: f32,
    pub vector_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
}

/// Fuse ranked per-branch result lists (best first, raw scores attached).
/// Returns the union sorted by fused score descending, ties by id ascending.
pub fn fuse_weighted_rrf(
    vector: &[(String, f32)],
    bm25: &[(String, f32)],
    cfg: &FusionConfig,
) -> Vec<FusedHit> {
    struct Branch {
        score: f32,
        rank: usize,
    }
    let mut vector_by_id: HashMap<&str, Branch> = HashMap::with_capacity(vector.len());
    for (i, (id, score)) in vector.iter().enumerate() {
        vector_by_id.entry(id).or_insert(Branch {
            score: *score,
            rank: i + 1,
        });
    }
    let mut bm25_by_id: HashMap<&str, Branch> = HashMap::with_capacity(bm25.len());
    for (i, (id, score)) in bm25.iter().enumerate() {
        bm25_by_id.entry(id).or_insert(Branch {
            score: *score,
            rank: i + 1,
        });
    }

    let mut union: Vec<&str> = Vec::with_capacity(vector.len() + bm25.len());
    let mut seen = std::collections::HashSet::new();
    for (id, _) in vector.iter().chain(bm25.iter()) {
        if seen.insert(id.as_str()) {
            union.push(id);
        }
    }

    let mut fused: Vec<FusedHit> = union
        .into_iter()
        .map(|id| {
            let v = vector_by_id.get(id);
            let b = bm25_by_id.get(id);
            let vector_valid = v.is_some_and(|br| br.score > VECTOR_SCORE_FLOOR);
            let bm25_valid = b.is_some();

            let score = if !vector_valid && bm25_valid {
                // BYPASS: dense branch is uninformative for this node; rank
                // by raw BM25 magnitude instead of reciprocal rank.
                cfg.bm25_weight * b.map_or(0.0, |br| br.score)
            } else {
                let vector_part = if vector_valid {
                    v.map_or(0.0, |br| cfg.vector_weight / (cfg.k + br.rank as f32))
                } else {
                    0.0
                };
                let bm25_part =
                    b.map_or(0.0, |br| cfg.bm25_weight / (cfg.k + br.rank as f32));
                vector_part + bm25_part
            };

            let mut sources = Vec::with_capacity(2);
            if v.is_some() {
                sources.push(RetrievalSource::Vector);
            }
            if b.is_some() {
                sources.push(RetrievalSource::Keyword);
            }

            FusedHit {
                id: id.to_string(),
                score,
                sources,
                vector_score: v.map_or(0.0, |br| br.score),
                bm25_score: b.map_or(0.0, |br| br.score),
                vector_rank: v.map(|br| br.rank),
                bm25_rank: b.map(|br| br.rank),
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        match b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        }
    });
    fused
}
