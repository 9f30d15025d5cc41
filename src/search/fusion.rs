//! Merges the vector and keyword rankings into one ordering.
//!
//! Fusion is deterministic for fixed inputs and config: ties break on the
//! higher raw channel score, then lexicographic id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{SearchResult, SearchType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    ScoreWeightedRrf,
    WeightedAverage,
    MaxConfidence,
    /// Legacy reciprocal-rank fusion.
    Rrf,
}

impl FusionStrategy {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "weighted_average" => Self::WeightedAverage,
            "max_confidence" => Self::MaxConfidence,
            "rrf" => Self::Rrf,
            _ => Self::ScoreWeightedRrf,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScoreWeightedRrf => "score_weighted_rrf",
            Self::WeightedAverage => "weighted_average",
            Self::MaxConfidence => "max_confidence",
            Self::Rrf => "rrf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    MinMax,
    ZScore,
    None,
}

impl Normalization {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "zscore" => Self::ZScore,
            "none" => Self::None,
            _ => Self::MinMax,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinMax => "minmax",
            Self::ZScore => "zscore",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionParams {
    pub strategy: FusionStrategy,
    pub normalization: Normalization,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: u32,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::ScoreWeightedRrf,
            normalization: Normalization::MinMax,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            rrf_k: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionTraceEntry {
    pub id: String,
    pub vector_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
    pub vector_norm: Option<f32>,
    pub keyword_norm: Option<f32>,
    pub fused: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionTrace {
    pub strategy: String,
    pub normalization: String,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: u32,
    pub entries: Vec<FusionTraceEntry>,
}

/// Normalize a score list. Single-item and constant-score lists collapse to
/// a constant 0.5 so one channel cannot dominate on a degenerate scale.
pub fn safe_normalize(scores: &[f32], normalization: Normalization) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    if scores.len() == 1 || (max - min).abs() < 1e-9 {
        return vec![0.5; scores.len()];
    }

    match normalization {
        Normalization::MinMax => {
            let range = max - min;
            scores.iter().map(|s| (s - min) / range).collect()
        }
        Normalization::ZScore => {
            let n = scores.len() as f32;
            let mean = scores.iter().sum::<f32>() / n;
            let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
            let std = variance.sqrt().max(1e-9);
            scores.iter().map(|s| (s - mean) / std).collect()
        }
        Normalization::None => scores.to_vec(),
    }
}

struct ChannelEntry {
    rank: usize,
    raw: f32,
    norm: f32,
}

/// Fuse the two channel orderings. Input lists are assumed ranked (best
/// first); output carries fused scores, 1-based ranks and a full trace.
pub fn fuse(
    vector: &[SearchResult],
    keyword: &[SearchResult],
    params: &FusionParams,
) -> (Vec<SearchResult>, FusionTrace) {
    let vector_norms = safe_normalize(
        &vector.iter().map(|r| r.score).collect::<Vec<_>>(),
        params.normalization,
    );
    let keyword_norms = safe_normalize(
        &keyword.iter().map(|r| r.score).collect::<Vec<_>>(),
        params.normalization,
    );

    // BTreeMap keeps candidate iteration deterministic by id.
    let mut vector_entries: BTreeMap<&str, ChannelEntry> = BTreeMap::new();
    for (i, result) in vector.iter().enumerate() {
        vector_entries.insert(
            result.id.as_str(),
            ChannelEntry { rank: i + 1, raw: result.score, norm: vector_norms[i] },
        );
    }
    let mut keyword_entries: BTreeMap<&str, ChannelEntry> = BTreeMap::new();
    for (i, result) in keyword.iter().enumerate() {
        keyword_entries.insert(
            result.id.as_str(),
            ChannelEntry { rank: i + 1, raw: result.score, norm: keyword_norms[i] },
        );
    }

    let mut candidates: BTreeMap<&str, &SearchResult> = BTreeMap::new();
    for result in keyword {
        candidates.insert(result.id.as_str(), result);
    }
    for result in vector {
        // Vector results win the payload when both channels return the id.
        candidates.insert(result.id.as_str(), result);
    }

    let k = params.rrf_k as f32;
    let (wv, wk) = (params.vector_weight, params.keyword_weight);

    let mut fused: Vec<(SearchResult, f32)> = Vec::with_capacity(candidates.len());
    let mut entries = Vec::with_capacity(candidates.len());

    for (id, base) in candidates {
        let v = vector_entries.remove(id);
        let kw = keyword_entries.remove(id);

        let nv = v.as_ref().map(|e| e.norm).unwrap_or(0.0);
        let nk = kw.as_ref().map(|e| e.norm).unwrap_or(0.0);
        let rrf_v = v.as_ref().map(|e| 1.0 / (k + e.rank as f32)).unwrap_or(0.0);
        let rrf_k_term = kw.as_ref().map(|e| 1.0 / (k + e.rank as f32)).unwrap_or(0.0);

        let score = match params.strategy {
            FusionStrategy::ScoreWeightedRrf => wv * nv + wk * nk + 0.1 * (rrf_v + rrf_k_term),
            FusionStrategy::WeightedAverage => wv * nv + wk * nk,
            FusionStrategy::MaxConfidence => nv.max(nk),
            FusionStrategy::Rrf => wv * rrf_v + wk * rrf_k_term,
        };

        let raw_best = v
            .as_ref()
            .map(|e| e.raw)
            .unwrap_or(f32::MIN)
            .max(kw.as_ref().map(|e| e.raw).unwrap_or(f32::MIN));

        let mut result = base.clone();
        result.vector_score = v.as_ref().map(|e| e.raw).or(result.vector_score);
        result.keyword_score = kw.as_ref().map(|e| e.raw).or(result.keyword_score);
        result.fusion_score = Some(score);
        result.score = score;
        result.search_type = match (&v, &kw) {
            (Some(_), Some(_)) => SearchType::Hybrid,
            (Some(_), None) => SearchType::VectorOnly,
            (None, _) => SearchType::KeywordOnly,
        };

        entries.push(FusionTraceEntry {
            id: id.to_string(),
            vector_rank: v.as_ref().map(|e| e.rank),
            keyword_rank: kw.as_ref().map(|e| e.rank),
            vector_norm: v.as_ref().map(|e| e.norm),
            keyword_norm: kw.as_ref().map(|e| e.norm),
            fused: score,
        });

        fused.push((result, raw_best));
    }

    fused.sort_by(|(a, raw_a), (b, raw_b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| raw_b.partial_cmp(raw_a).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut results: Vec<SearchResult> = fused.into_iter().map(|(r, _)| r).collect();
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = Some(i + 1);
    }

    entries.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let trace = FusionTrace {
        strategy: params.strategy.as_str().to_string(),
        normalization: params.normalization.as_str().to_string(),
        vector_weight: wv,
        keyword_weight: wk,
        rrf_k: params.rrf_k,
        entries,
    };

    (results, trace)
}

/// Shift `(vector_weight, keyword_weight)` by query shape: short queries
/// with a rare, lexically distinctive term lean on the keyword channel;
/// long prose queries lean on the vector channel. The mapping is a fixed
/// step function so fusion stays deterministic.
pub fn adaptive_weights(
    content_token_count: usize,
    rare_term_count: usize,
    defaults: (f32, f32),
) -> (f32, f32) {
    if content_token_count <= 3 && rare_term_count >= 1 {
        (0.4, 0.6)
    } else if content_token_count >= 9 && rare_term_count == 0 {
        (0.8, 0.2)
    } else {
        defaults
    }
}
