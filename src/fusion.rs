//! Fusion Engine: combines ranked hit lists from the BM25 and vector legs.
//!
//! All three methods produce a deduplicated list sorted by fused score
//! descending, with ranks rewritten to `1..N`. A stable sort, with ties
//! broken by document id, keeps repeated runs on the same input bit-identical.

use std::collections::HashMap;

use crate::models::{ScoredDoc, SearchType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMethod {
    Rrf,
    WeightedSum,
    MaxScore,
}

impl FusionMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rrf" => Some(FusionMethod::Rrf),
            "weighted_sum" => Some(FusionMethod::WeightedSum),
            "max_score" => Some(FusionMethod::MaxScore),
            _ => None,
        }
    }
}

/// One leg's ranked hit: id, raw score, opaque payload, rank (1-based).
#[derive(Debug, Clone)]
pub struct LegHit {
    pub id: String,
    pub score: f64,
    pub rank: usize,
    pub payload: serde_json::Value,
}

pub struct FusionParams {
    pub method: FusionMethod,
    pub rank_constant: f64,
    pub bm25_weight: f64,
    pub vector_weight: f64,
}

/// Runs the selected fusion method, then dedups, sorts, and re-ranks.
pub fn fuse(bm25: &[LegHit], vector: &[LegHit], params: &FusionParams) -> Vec<ScoredDoc> {
    let fused = match params.method {
        FusionMethod::Rrf => fuse_rrf(bm25, vector, params.rank_constant),
        FusionMethod::WeightedSum => {
            fuse_weighted(bm25, vector, params.bm25_weight, params.vector_weight, false)
        }
        FusionMethod::MaxScore => {
            fuse_weighted(bm25, vector, params.bm25_weight, params.vector_weight, true)
        }
    };

    rank_and_limit(filter_duplicates(fused), usize::MAX)
}

fn fuse_rrf(bm25: &[LegHit], vector: &[LegHit], rank_constant: f64) -> Vec<ScoredDoc> {
    let mut by_id: HashMap<String, ScoredDoc> = HashMap::new();

    for hit in bm25 {
        let contrib = 1.0 / (rank_constant + hit.rank as f64);
        let entry = by_id.entry(hit.id.clone()).or_insert_with(|| ScoredDoc {
            id: hit.id.clone(),
            score: 0.0,
            bm25_score: None,
            vector_score: None,
            fused_score: 0.0,
            source: hit.payload.clone(),
            index: 0,
            rank: 0,
            search_type: SearchType::Bm25,
        });
        entry.bm25_score = Some(hit.score);
        entry.fused_score += contrib;
    }

    for hit in vector {
        let contrib = 1.0 / (rank_constant + hit.rank as f64);
        let entry = by_id.entry(hit.id.clone()).or_insert_with(|| ScoredDoc {
            id: hit.id.clone(),
            score: 0.0,
            bm25_score: None,
            vector_score: None,
            fused_score: 0.0,
            source: hit.payload.clone(),
            index: 0,
            rank: 0,
            search_type: SearchType::Vector,
        });
        entry.vector_score = Some(hit.score);
        entry.fused_score += contrib;
        if entry.bm25_score.is_some() {
            entry.search_type = SearchType::Hybrid;
        }
    }

    by_id.into_values().collect()
}

fn fuse_weighted(
    bm25: &[LegHit],
    vector: &[LegHit],
    bm25_weight: f64,
    vector_weight: f64,
    max_score: bool,
) -> Vec<ScoredDoc> {
    let (w_bm25, w_vec) = normalize_weights(bm25_weight, vector_weight);

    let bm25_max = bm25.iter().map(|h| h.score).fold(0.0_f64, f64::max);
    let bm25_norm_div = if bm25_max == 0.0 { 1.0 } else { bm25_max };
    let vec_max = vector.iter().map(|h| h.score).fold(0.0_f64, f64::max);
    let vec_norm_div = if vec_max == 0.0 { 1.0 } else { vec_max };

    let mut by_id: HashMap<String, ScoredDoc> = HashMap::new();

    for hit in bm25 {
        let norm = hit.score / bm25_norm_div;
        let entry = by_id.entry(hit.id.clone()).or_insert_with(|| ScoredDoc {
            id: hit.id.clone(),
            score: 0.0,
            bm25_score: None,
            vector_score: None,
            fused_score: 0.0,
            source: hit.payload.clone(),
            index: 0,
            rank: 0,
            search_type: SearchType::Bm25,
        });
        entry.bm25_score = Some(hit.score);
        entry.fused_score = if max_score {
            entry.fused_score.max(norm)
        } else {
            entry.fused_score + w_bm25 * norm
        };
    }

    for hit in vector {
        let norm = hit.score / vec_norm_div;
        let entry = by_id.entry(hit.id.clone()).or_insert_with(|| ScoredDoc {
            id: hit.id.clone(),
            score: 0.0,
            bm25_score: None,
            vector_score: None,
            fused_score: 0.0,
            source: hit.payload.clone(),
            index: 0,
            rank: 0,
            search_type: SearchType::Vector,
        });
        entry.vector_score = Some(hit.score);
        entry.fused_score = if max_score {
            entry.fused_score.max(norm)
        } else {
            entry.fused_score + w_vec * norm
        };
        if entry.bm25_score.is_some() {
            entry.search_type = SearchType::Hybrid;
        }
    }

    by_id.into_values().collect()
}

fn normalize_weights(bm25_weight: f64, vector_weight: f64) -> (f64, f64) {
    if bm25_weight == 0.0 && vector_weight == 0.0 {
        return (0.5, 0.5);
    }
    let sum = bm25_weight + vector_weight;
    (bm25_weight / sum, vector_weight / sum)
}

pub fn filter_duplicates(docs: Vec<ScoredDoc>) -> Vec<ScoredDoc> {
    let mut seen = std::collections::HashSet::new();
    docs.into_iter()
        .filter(|d| seen.insert(d.id.clone()))
        .collect()
}

pub fn apply_threshold(docs: Vec<ScoredDoc>, min_score: f64) -> Vec<ScoredDoc> {
    if min_score <= 0.0 {
        return docs;
    }
    docs.into_iter().filter(|d| d.fused_score >= min_score).collect()
}

/// Sorts by fused score descending (ties broken by id for determinism),
/// rewrites `index`/`rank` to `0..N`/`1..N`, and truncates to `limit`.
pub fn rank_and_limit(mut docs: Vec<ScoredDoc>, limit: usize) -> Vec<ScoredDoc> {
    docs.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    docs.truncate(limit);
    for (i, d) in docs.iter_mut().enumerate() {
        d.index = i;
        d.rank = i + 1;
        d.score = d.fused_score;
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64, rank: usize) -> LegHit {
        LegHit {
            id: id.to_string(),
            score,
            rank,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn rrf_sums_contributions_for_docs_in_both_legs() {
        let bm25 = vec![hit("a", 10.0, 1), hit("b", 5.0, 2)];
        let vector = vec![hit("a", 0.9, 1)];
        let params = FusionParams {
            method: FusionMethod::Rrf,
            rank_constant: 60.0,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        };
        let fused = fuse(&bm25, &vector, &params);
        let a = fused.iter().find(|d| d.id == "a").unwrap();
        assert_eq!(a.search_type, SearchType::Hybrid);
        assert!((a.fused_score - (1.0 / 61.0 + 1.0 / 61.0)).abs() < 1e-9);
    }

    #[test]
    fn rrf_symmetry_swapping_legs_yields_same_scores() {
        let bm25 = vec![hit("a", 10.0, 1), hit("b", 5.0, 2)];
        let vector = vec![hit("a", 0.9, 2), hit("c", 0.5, 1)];
        let params = FusionParams {
            method: FusionMethod::Rrf,
            rank_constant: 60.0,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        };
        let forward = fuse(&bm25, &vector, &params);
        let swapped = fuse(&vector, &bm25, &params);

        let mut f: Vec<(String, f64)> = forward.iter().map(|d| (d.id.clone(), d.fused_score)).collect();
        let mut s: Vec<(String, f64)> = swapped.iter().map(|d| (d.id.clone(), d.fused_score)).collect();
        f.sort();
        s.sort();
        assert_eq!(f, s);
    }

    #[test]
    fn weighted_sum_zero_weights_defaults_to_half_half() {
        let bm25 = vec![hit("a", 10.0, 1)];
        let vector = vec![hit("a", 0.5, 1)];
        let zero = FusionParams {
            method: FusionMethod::WeightedSum,
            rank_constant: 60.0,
            bm25_weight: 0.0,
            vector_weight: 0.0,
        };
        let half = FusionParams {
            method: FusionMethod::WeightedSum,
            rank_constant: 60.0,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        };
        let fused_zero = fuse(&bm25, &vector, &zero);
        let fused_half = fuse(&bm25, &vector, &half);
        assert_eq!(fused_zero[0].fused_score, fused_half[0].fused_score);
    }

    #[test]
    fn determinism_same_inputs_same_output() {
        let bm25 = vec![hit("a", 10.0, 1), hit("b", 7.0, 2), hit("c", 3.0, 3)];
        let vector = vec![hit("b", 0.8, 1), hit("a", 0.6, 2)];
        let params = FusionParams {
            method: FusionMethod::Rrf,
            rank_constant: 60.0,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        };
        let first = fuse(&bm25, &vector, &params);
        let second = fuse(&bm25, &vector, &params);
        let f1: Vec<(String, f64)> = first.iter().map(|d| (d.id.clone(), d.fused_score)).collect();
        let f2: Vec<(String, f64)> = second.iter().map(|d| (d.id.clone(), d.fused_score)).collect();
        assert_eq!(f1, f2);
    }

    #[test]
    fn max_score_takes_the_larger_normalized_leg_score() {
        let bm25 = vec![hit("a", 10.0, 1)];
        let vector = vec![hit("a", 0.3, 1), hit("b", 1.0, 2)];
        let params = FusionParams {
            method: FusionMethod::MaxScore,
            rank_constant: 60.0,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        };
        let fused = fuse(&bm25, &vector, &params);
        let a = fused.iter().find(|d| d.id == "a").unwrap();
        // bm25 normalized = 1.0 (its own max), vector normalized = 0.3 -> max is 1.0
        assert!((a.fused_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rank_and_limit_truncates_and_rewrites_ranks() {
        let docs = vec![
            ScoredDoc {
                id: "a".into(),
                score: 0.0,
                bm25_score: None,
                vector_score: None,
                fused_score: 1.0,
                source: serde_json::json!({}),
                index: 0,
                rank: 0,
                search_type: SearchType::Bm25,
            },
            ScoredDoc {
                id: "b".into(),
                score: 0.0,
                bm25_score: None,
                vector_score: None,
                fused_score: 2.0,
                source: serde_json::json!({}),
                index: 0,
                rank: 0,
                search_type: SearchType::Bm25,
            },
        ];
        let limited = rank_and_limit(docs, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "b");
        assert_eq!(limited[0].rank, 1);
    }
}
