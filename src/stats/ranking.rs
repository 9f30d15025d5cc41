//! Domainless ranking features: coverage, field boosts, proximity, and the
//! exclusivity penalty. These re-score fused candidates without any
//! domain-specific vocabulary; everything derives from corpus statistics
//! and the candidate's own text.

use super::CorpusStats;
use crate::text::raw_tokens;
use crate::types::SearchResult;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoverageFeatures {
    /// Fraction of synonym groups with at least one term present.
    pub coverage: f32,
    /// 1.0 when any group term hits a titled payload field.
    pub field_boost: f32,
    /// Closeness of the minimum token window spanning all groups; 0 when
    /// some group is absent.
    pub proximity: f32,
}

/// Compute coverage features for a candidate against synonym term groups.
pub fn coverage_features(result: &SearchResult, groups: &[Vec<String>]) -> CoverageFeatures {
    if groups.is_empty() {
        return CoverageFeatures::default();
    }

    let tokens = raw_tokens(&result.content);
    let titled: String = ["header", "title"]
        .iter()
        .filter_map(|key| result.payload.get(*key).and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    let titled_tokens = raw_tokens(&titled);

    // For each token position, which group (if any) does it satisfy.
    let mut positions: Vec<(usize, usize)> = Vec::new();
    let mut present = vec![false; groups.len()];
    let mut field_boost = 0.0;

    for (group_idx, group) in groups.iter().enumerate() {
        for term in group {
            if titled_tokens.iter().any(|t| t == term) {
                field_boost = 1.0;
            }
        }
        for (pos, token) in tokens.iter().enumerate() {
            if group.iter().any(|term| term == token) {
                positions.push((pos, group_idx));
                present[group_idx] = true;
            }
        }
    }

    let present_count = present.iter().filter(|&&p| p).count();
    let coverage = present_count as f32 / groups.len() as f32;

    let proximity = if present_count == groups.len() && groups.len() > 1 {
        match min_window_span(&positions, groups.len()) {
            Some(span) => {
                let slack = span.saturating_sub(groups.len()) as f32;
                1.0 / (1.0 + slack / 10.0)
            }
            None => 0.0,
        }
    } else if groups.len() == 1 && present_count == 1 {
        1.0
    } else {
        0.0
    };

    CoverageFeatures { coverage, field_boost, proximity }
}

/// Which synonym groups the candidate's content or titled fields cover.
pub fn present_mask(result: &SearchResult, groups: &[Vec<String>]) -> Vec<bool> {
    let tokens = raw_tokens(&result.content);
    let titled: String = ["header", "title"]
        .iter()
        .filter_map(|key| result.payload.get(*key).and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    let titled_tokens = raw_tokens(&titled);

    groups
        .iter()
        .map(|group| {
            group.iter().any(|term| {
                tokens.iter().any(|t| t == term) || titled_tokens.iter().any(|t| t == term)
            })
        })
        .collect()
}

/// Smallest token-position window containing at least one hit from every
/// group. `positions` is (token position, group index).
fn min_window_span(positions: &[(usize, usize)], group_count: usize) -> Option<usize> {
    let mut sorted = positions.to_vec();
    sorted.sort_unstable();

    let mut counts = vec![0usize; group_count];
    let mut covered = 0usize;
    let mut best: Option<usize> = None;
    let mut left = 0;

    for right in 0..sorted.len() {
        let (_, group) = sorted[right];
        counts[group] += 1;
        if counts[group] == 1 {
            covered += 1;
        }
        while covered == group_count {
            let span = sorted[right].0 - sorted[left].0 + 1;
            best = Some(best.map_or(span, |b| b.min(span)));
            let (_, left_group) = sorted[left];
            counts[left_group] -= 1;
            if counts[left_group] == 0 {
                covered -= 1;
            }
            left += 1;
        }
    }
    best
}

/// Penalty in [0, 1] for a candidate that carries terms from some groups
/// while missing groups exclusive to the query cluster: rare terms (IDF at
/// or above `high_idf`) with no meaningful association (PMI, co-occurrence)
/// to the terms the candidate does carry. Zero when coverage is complete or
/// there are fewer than two groups.
pub fn exclusivity_penalty(
    groups: &[Vec<String>],
    present: &[bool],
    stats: &CorpusStats,
    high_idf: f64,
) -> f32 {
    if groups.len() < 2 || present.iter().all(|&p| p) {
        return 0.0;
    }

    let present_terms: Vec<&String> = groups
        .iter()
        .zip(present)
        .filter(|(_, &p)| p)
        .flat_map(|(group, _)| group)
        .collect();
    if present_terms.is_empty() {
        return 0.0;
    }

    let mut exclusive_missing = 0usize;
    for (group, &is_present) in groups.iter().zip(present) {
        if is_present {
            continue;
        }
        let rare = group.iter().all(|term| stats.idf_of(term) >= high_idf);
        if !rare {
            continue;
        }
        let associated = group.iter().any(|term| {
            present_terms.iter().any(|p| {
                stats.pmi_of(term, p) >= 1.0 || stats.cooc_of(term, p) >= 2
            })
        });
        if !associated {
            exclusive_missing += 1;
        }
    }

    (exclusive_missing as f32 / groups.len() as f32).clamp(0.0, 1.0)
}

/// Post-fusion keyword-points re-score. Rewards coverage and closeness,
/// subtracts the exclusivity penalty, never goes negative.
pub fn keyword_points_score(base: f32, features: &CoverageFeatures, penalty: f32) -> f32 {
    (base + 0.15 * features.coverage + 0.05 * features.field_boost + 0.05 * features.proximity
        - 0.2 * penalty)
        .max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchType;
    use serde_json::json;

    fn candidate(content: &str) -> SearchResult {
        let mut result = SearchResult::new("c1", 0.5, SearchType::Hybrid);
        result.content = content.to_string();
        result
    }

    fn group(terms: &[&str]) -> Vec<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn full_coverage_with_adjacent_terms_scores_high_proximity() {
        let result = candidate("postgres replication lag monitoring");
        let groups = vec![group(&["replication"]), group(&["lag"])];
        let features = coverage_features(&result, &groups);
        assert_eq!(features.coverage, 1.0);
        assert!(features.proximity > 0.9);
    }

    #[test]
    fn partial_coverage_zeroes_proximity() {
        let result = candidate("postgres replication overview");
        let groups = vec![group(&["replication"]), group(&["lag"])];
        let features = coverage_features(&result, &groups);
        assert_eq!(features.coverage, 0.5);
        assert_eq!(features.proximity, 0.0);
    }

    #[test]
    fn distant_terms_score_lower_proximity_than_adjacent() {
        let filler = "word ".repeat(40);
        let far = candidate(&format!("replication {filler} lag"));
        let near = candidate("replication lag");
        let groups = vec![group(&["replication"]), group(&["lag"])];
        let far_features = coverage_features(&far, &groups);
        let near_features = coverage_features(&near, &groups);
        assert!(near_features.proximity > far_features.proximity);
    }

    #[test]
    fn synonyms_inside_a_group_count_as_presence() {
        let result = candidate("k8s cluster sizing");
        let groups = vec![group(&["kubernetes", "k8s"]), group(&["cluster"])];
        let features = coverage_features(&result, &groups);
        assert_eq!(features.coverage, 1.0);
    }

    #[test]
    fn titled_field_hit_sets_field_boost() {
        let mut result = candidate("body text without the term");
        result.payload.insert("header".into(), json!("Replication Lag"));
        let groups = vec![group(&["replication"]), group(&["lag"])];
        let features = coverage_features(&result, &groups);
        assert_eq!(features.field_boost, 1.0);
    }

    #[test]
    fn penalty_is_zero_for_complete_coverage_or_single_group() {
        let stats = CorpusStats::default();
        let groups = vec![group(&["alpha"]), group(&["beta"])];
        assert_eq!(exclusivity_penalty(&groups, &[true, true], &stats, 2.5), 0.0);
        assert_eq!(
            exclusivity_penalty(&[group(&["alpha"])], &[false], &stats, 2.5),
            0.0
        );
    }

    #[test]
    fn unassociated_rare_missing_group_is_penalized() {
        let mut stats = CorpusStats::default();
        stats.idf.insert("zookeeper".into(), 3.4);
        stats.idf.insert("kafka".into(), 1.2);

        let groups = vec![group(&["kafka"]), group(&["zookeeper"])];
        let penalty = exclusivity_penalty(&groups, &[true, false], &stats, 2.5);
        assert!(penalty > 0.0);
    }

    #[test]
    fn associated_missing_group_is_not_penalized() {
        let mut stats = CorpusStats::default();
        stats.idf.insert("zookeeper".into(), 3.4);
        stats
            .cooc
            .entry("zookeeper".into())
            .or_default()
            .insert("kafka".into(), 12);

        let groups = vec![group(&["kafka"]), group(&["zookeeper"])];
        let penalty = exclusivity_penalty(&groups, &[true, false], &stats, 2.5);
        assert_eq!(penalty, 0.0);
    }

    #[test]
    fn keyword_points_never_go_negative() {
        let features = CoverageFeatures::default();
        assert_eq!(keyword_points_score(0.05, &features, 1.0), 0.0);
        let strong = CoverageFeatures { coverage: 1.0, field_boost: 1.0, proximity: 1.0 };
        assert!(keyword_points_score(0.5, &strong, 0.0) > 0.5);
    }
}
