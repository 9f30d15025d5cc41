//! Cross-encoder reranking of the top fusion candidates.
//!
//! The reranker is best-effort: any failure (disabled, HTTP error,
//! malformed response, score-count mismatch, timeout) falls back to a
//! pass-through that returns the fusion ordering untouched.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;

use crate::types::SearchResult;

pub use http::HttpReranker;

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub text: String,
}

/// Batched (query, candidates) → scores capability.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score in [0, 1] per candidate, in candidate order.
    async fn score(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> anyhow::Result<Vec<f32>>;

    async fn is_healthy(&self) -> bool;

    async fn models(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct RerankParams {
    /// How many fusion candidates are offered to the model.
    pub top_n_in: usize,
    /// How many reranked candidates survive.
    pub top_k: usize,
    /// Per-request score floor; candidates below it are cut.
    pub score_threshold: f32,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<SearchResult>,
    /// False on any fallback path.
    pub reranking_enabled: bool,
    pub documents_reranked: usize,
}

impl RerankOutcome {
    fn pass_through(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            reranking_enabled: false,
            documents_reranked: 0,
        }
    }
}

/// Run the reranker over the fusion ordering. The fusion scores are
/// replaced by reranker scores (the originals preserved as
/// `original_score`); any failure path returns the input unchanged.
pub async fn apply_reranking(
    reranker: &dyn Reranker,
    query: &str,
    candidates: Vec<SearchResult>,
    params: &RerankParams,
) -> RerankOutcome {
    if candidates.is_empty() {
        return RerankOutcome::pass_through(candidates);
    }

    let offered: Vec<RerankCandidate> = candidates
        .iter()
        .take(params.top_n_in)
        .map(|r| RerankCandidate {
            id: r.id.clone(),
            text: r.content.clone(),
        })
        .collect();

    let scores =
        match tokio::time::timeout(params.timeout, reranker.score(query, &offered)).await {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reranker failed, passing fusion ordering through");
                return RerankOutcome::pass_through(candidates);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = params.timeout.as_millis() as u64,
                    "reranker timed out, passing fusion ordering through"
                );
                return RerankOutcome::pass_through(candidates);
            }
        };

    if scores.len() != offered.len() {
        tracing::warn!(
            expected = offered.len(),
            actual = scores.len(),
            "reranker score count mismatch, passing fusion ordering through"
        );
        return RerankOutcome::pass_through(candidates);
    }

    let documents_reranked = offered.len();
    let mut reranked: Vec<SearchResult> = candidates
        .into_iter()
        .take(documents_reranked)
        .zip(scores)
        .filter(|(_, score)| *score >= params.score_threshold)
        .map(|(mut result, score)| {
            result.original_score = Some(result.score);
            result.reranker_score = Some(score);
            result.fusion_score = Some(score);
            result.score = score;
            result
        })
        .collect();

    // Sort by reranker score; equal scores keep the fusion order (the
    // input order), which a stable sort preserves.
    reranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    reranked.truncate(params.top_k);
    for (i, result) in reranked.iter_mut().enumerate() {
        result.rank = Some(i + 1);
    }

    RerankOutcome {
        results: reranked,
        reranking_enabled: true,
        documents_reranked,
    }
}
