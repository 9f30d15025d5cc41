//! Budgeted context packing. Greedy selection over boosted scores with an
//! MMR-style relevance/novelty objective, per-document and per-section
//! caps, and section reunion before a budget drop. Every decision lands in
//! the trace so selection is fully reconstructible.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chunking::TokenCounter;
use crate::config::PackingConfig;
use crate::embeddings::cosine_similarity;
use crate::sections::parse_section_path;
use crate::text::tokenize;
use crate::types::SearchResult;

static MEASUREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:%|percent|kg|km|cm|mm|gb|mb|kb|ms|tokens?|°c|°f|usd|eur)\b")
        .expect("measurement regex is valid")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:19|20)\d{2}\b|\b\d{4}-\d{2}-\d{2}\b").expect("date regex is valid")
});
static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bis defined as\b|\brefers to\b|\bmeans that\b").expect("definition regex is valid")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackingTrace {
    pub selected: Vec<String>,
    pub token_counts: HashMap<String, usize>,
    /// Post-bonus score per selected id.
    pub scores: HashMap<String, f32>,
    pub novelty: HashMap<String, f32>,
    /// Dropped id → reason.
    pub dropped: HashMap<String, String>,
    pub doc_counts: HashMap<String, usize>,
    pub section_counts: HashMap<String, usize>,
    pub reunion_attempts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedContext {
    pub chunks: Vec<SearchResult>,
    pub total_tokens: usize,
    pub truncated: bool,
    pub trace: PackingTrace,
}

pub struct ContextPacker {
    config: PackingConfig,
    counter: TokenCounter,
}

/// Bonus in [0, cap] for text shapes that tend to answer questions:
/// measurements, definitional phrases, dates, list structure, and a header
/// matching the query.
pub fn answerability_bonus(result: &SearchResult, query: &str, cap: f32) -> f32 {
    let mut bonus = 0.0f32;
    let content = &result.content;

    if MEASUREMENT_RE.is_match(content) {
        bonus += 0.05;
    }
    if DEFINITION_RE.is_match(content) {
        bonus += 0.05;
    }
    if DATE_RE.is_match(content) {
        bonus += 0.05;
    }
    let list_lines = content
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_digit() && trimmed[1..].starts_with('.'))
                    .unwrap_or(false)
        })
        .count();
    if list_lines >= 2 {
        bonus += 0.05;
    }
    if let Some(header) = result.title() {
        let header_tokens: HashSet<String> = tokenize(header).into_iter().collect();
        if tokenize(query).iter().any(|t| header_tokens.contains(t)) {
            bonus += 0.05;
        }
    }

    bonus.min(cap.max(0.0))
}

/// 1 − max similarity to anything already selected. Cosine over chunk
/// vectors when both sides have one, Jaccard on token bags otherwise.
fn novelty(
    candidate: &SearchResult,
    selected: &[SearchResult],
    vectors: Option<&HashMap<String, Vec<f32>>>,
) -> f32 {
    if selected.is_empty() {
        return 1.0;
    }
    let max_similarity = selected
        .iter()
        .map(|other| similarity(candidate, other, vectors))
        .fold(0.0f32, f32::max);
    (1.0 - max_similarity).clamp(0.0, 1.0)
}

fn similarity(
    a: &SearchResult,
    b: &SearchResult,
    vectors: Option<&HashMap<String, Vec<f32>>>,
) -> f32 {
    if let Some(vectors) = vectors {
        if let (Some(va), Some(vb)) = (vectors.get(&a.id), vectors.get(&b.id)) {
            return cosine_similarity(va, vb).clamp(-1.0, 1.0);
        }
    }
    jaccard(&a.content, &b.content)
}

fn jaccard(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f32;
    let union = set_a.union(&set_b).count() as f32;
    intersection / union
}

fn doc_key(result: &SearchResult) -> String {
    result.doc_id().unwrap_or(&result.id).to_string()
}

/// Chunks without any payload bucket to the shared "default" section;
/// chunks with a section path share a per-document bucket; everything else
/// gets its own bucket so the cap never binds.
fn section_key(result: &SearchResult) -> String {
    if result.payload.is_empty() {
        return "default".to_string();
    }
    match result
        .section_path()
        .and_then(|p| parse_section_path(p).map(|(base, _)| base))
    {
        Some(base) => format!("{}/{base}", doc_key(result)),
        None => result.id.clone(),
    }
}

impl ContextPacker {
    pub fn new(config: PackingConfig, counter: TokenCounter) -> Self {
        Self { config, counter }
    }

    fn token_cost(&self, result: &SearchResult) -> usize {
        result
            .payload
            .get("tokenCount")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or_else(|| self.counter.count(&result.content))
    }

    /// Reorder candidates by the MMR objective without applying budget or
    /// caps. Used by the engine's optional novelty re-sort stage.
    pub fn mmr_order(
        &self,
        candidates: Vec<SearchResult>,
        vectors: Option<&HashMap<String, Vec<f32>>>,
    ) -> Vec<SearchResult> {
        let alpha = self.config.mmr_alpha.clamp(0.0, 1.0);
        let mut remaining = candidates;
        let mut ordered: Vec<SearchResult> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_key = f32::MIN;
            for (i, candidate) in remaining.iter().enumerate() {
                let n = novelty(candidate, &ordered, vectors);
                let objective = alpha * candidate.score + (1.0 - alpha) * n;
                if objective > best_key
                    || (objective == best_key && candidate.id < remaining[best_idx].id)
                {
                    best_key = objective;
                    best_idx = i;
                }
            }
            ordered.push(remaining.remove(best_idx));
        }
        ordered
    }

    pub fn pack(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        vectors: Option<&HashMap<String, Vec<f32>>>,
    ) -> PackedContext {
        let alpha = self.config.mmr_alpha.clamp(0.0, 1.0);
        let budget = self.config.max_context_tokens;
        let mut trace = PackingTrace::default();

        // Boost by answerability, then greedy-process best first.
        let mut remaining: Vec<(SearchResult, f32)> = candidates
            .into_iter()
            .map(|c| {
                let boosted =
                    c.score + answerability_bonus(&c, query, self.config.answerability_bonus_cap);
                (c, boosted)
            })
            .collect();
        remaining.sort_by(|(a, ba), (b, bb)| {
            bb.partial_cmp(ba)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut selected: Vec<SearchResult> = Vec::new();
        let mut costs: Vec<usize> = Vec::new();
        let mut total_tokens = 0usize;
        let mut truncated = false;

        while !remaining.is_empty() {
            // MMR pick: best α·boosted + (1−α)·novelty among what's left.
            let mut best_idx = 0;
            let mut best_obj = f32::MIN;
            let mut best_novelty = 1.0f32;
            for (i, (candidate, boosted)) in remaining.iter().enumerate() {
                let n = novelty(candidate, &selected, vectors);
                let objective = alpha * boosted + (1.0 - alpha) * n;
                let better = objective > best_obj
                    || (objective == best_obj && candidate.id < remaining[best_idx].0.id);
                if better {
                    best_obj = objective;
                    best_idx = i;
                    best_novelty = n;
                }
            }

            let (candidate, boosted) = remaining.remove(best_idx);

            let doc = doc_key(&candidate);
            if trace.doc_counts.get(&doc).copied().unwrap_or(0) >= self.config.per_doc_cap {
                trace
                    .dropped
                    .insert(candidate.id.clone(), format!("per-doc cap reached for {doc}"));
                continue;
            }
            let section = section_key(&candidate);
            if trace.section_counts.get(&section).copied().unwrap_or(0)
                >= self.config.per_section_cap
            {
                trace.dropped.insert(
                    candidate.id.clone(),
                    format!("per-section cap reached for {section}"),
                );
                continue;
            }

            let cost = self.token_cost(&candidate);
            if total_tokens + cost > budget {
                if self.config.section_reunion
                    && self.try_reunion(
                        &candidate,
                        &mut selected,
                        &mut costs,
                        &mut total_tokens,
                        budget,
                        &mut trace,
                    )
                {
                    continue;
                }
                truncated = true;
                trace
                    .dropped
                    .insert(candidate.id.clone(), "budget exceeded".to_string());
                continue;
            }

            total_tokens += cost;
            *trace.doc_counts.entry(doc).or_insert(0) += 1;
            *trace.section_counts.entry(section).or_insert(0) += 1;
            trace.selected.push(candidate.id.clone());
            trace.token_counts.insert(candidate.id.clone(), cost);
            trace.scores.insert(candidate.id.clone(), boosted);
            trace.novelty.insert(candidate.id.clone(), best_novelty);
            costs.push(cost);
            selected.push(candidate);
        }

        PackedContext {
            chunks: selected,
            total_tokens,
            truncated,
            trace,
        }
    }

    /// When a section member no longer fits, try folding its text into an
    /// already-selected sibling of the same section instead of dropping it.
    fn try_reunion(
        &self,
        candidate: &SearchResult,
        selected: &mut [SearchResult],
        costs: &mut [usize],
        total_tokens: &mut usize,
        budget: usize,
        trace: &mut PackingTrace,
    ) -> bool {
        let Some(path) = candidate.section_path() else { return false };
        if parse_section_path(path).is_none() {
            return false;
        }
        let candidate_section = section_key(candidate);

        let sibling_idx = selected
            .iter()
            .position(|s| !s.payload.is_empty() && section_key(s) == candidate_section);
        let Some(idx) = sibling_idx else { return false };

        let merged_content = format!("{}\n{}", selected[idx].content, candidate.content);
        let merged_cost = self.counter.count(&merged_content);
        let new_total = *total_tokens - costs[idx] + merged_cost;

        if new_total > budget {
            trace.reunion_attempts.push(format!(
                "{} -> {} (over budget)",
                candidate.id, selected[idx].id
            ));
            return false;
        }

        trace
            .reunion_attempts
            .push(format!("{} -> {} (merged)", candidate.id, selected[idx].id));
        let sibling_id = selected[idx].id.clone();
        selected[idx].content = merged_content;
        *total_tokens = new_total;
        trace.token_counts.insert(sibling_id, merged_cost);
        costs[idx] = merged_cost;
        true
    }
}
