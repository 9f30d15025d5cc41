//! Answerability guardrail. Decides from score statistics whether the
//! retrieved evidence is strong enough to answer, and produces a
//! structured "I don't know" response when it is not.

pub mod audit;

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{AnswerabilityThreshold, TenantGuardrailConfig};
use crate::text::tokenize;
use crate::types::{SearchResult, UserContext};

pub use audit::{AuditLog, AuditRecord, LatencyBreakdown};

/// How many top scores feed the statistics.
pub const SCORE_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreStatistics {
    pub mean: f32,
    pub max: f32,
    pub min: f32,
    pub std_dev: f32,
    pub count: usize,
    pub p25: f32,
    pub p50: f32,
    pub p75: f32,
    pub p90: f32,
}

impl ScoreStatistics {
    pub fn from_scores(scores: &[f32]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let count = scores.len();
        let n = count as f32;
        let mean = scores.iter().sum::<f32>() / n;
        let max = scores.iter().copied().fold(f32::MIN, f32::max);
        let min = scores.iter().copied().fold(f32::MAX, f32::min);
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;

        let mut sorted = scores.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Self {
            mean,
            max,
            min,
            std_dev: variance.sqrt(),
            count,
            p25: percentile(&sorted, 0.25),
            p50: percentile(&sorted, 0.50),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.90),
        }
    }
}

/// Linear-interpolated percentile over an ascending-sorted slice.
fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let position = q * (sorted.len() - 1) as f32;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f32;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmScores {
    pub statistical: f32,
    pub threshold: f32,
    pub ml_features: f32,
    pub reranker_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerabilityScore {
    pub confidence: f32,
    pub stats: ScoreStatistics,
    pub components: AlgorithmScores,
    pub reasoning: String,
    pub computation_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Answerable,
    NotAnswerable,
    Bypassed,
    Disabled,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answerable => "answerable",
            Self::NotAnswerable => "not_answerable",
            Self::Bypassed => "bypassed",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdkResponse {
    pub message: String,
    pub reason_code: String,
    pub suggestions: Vec<String>,
    pub confidence_level: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailDecision {
    pub is_answerable: bool,
    pub decision: DecisionType,
    pub score: AnswerabilityScore,
    pub threshold: AnswerabilityThreshold,
    #[serde(default)]
    pub idk_response: Option<IdkResponse>,
}

struct Predicate {
    name: &'static str,
    reason_code: &'static str,
    passed: bool,
    detail: String,
}

pub struct Guardrail;

impl Guardrail {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        query: &str,
        results: &[SearchResult],
        user: &UserContext,
        config: &TenantGuardrailConfig,
        reranking_ran: bool,
    ) -> GuardrailDecision {
        let started = Instant::now();
        let threshold = config.threshold;

        if !config.enabled {
            return Self::pass_through(
                DecisionType::Disabled,
                "GUARDRAIL_DISABLED",
                threshold,
                started,
            );
        }
        if config.bypass_enabled
            && user.group_ids.iter().any(|g| config.bypass_groups.contains(g))
        {
            return Self::pass_through(
                DecisionType::Bypassed,
                "BYPASS_ENABLED",
                threshold,
                started,
            );
        }

        let scores: Vec<f32> = results
            .iter()
            .take(SCORE_SAMPLE_SIZE)
            .map(|r| r.score)
            .collect();
        let stats = ScoreStatistics::from_scores(&scores);

        let statistical = statistical_score(&stats);
        let ml_features = ml_features_score(query, results);
        let reranker_confidence = if reranking_ran {
            results
                .first()
                .and_then(|r| r.reranker_score)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        // The confidence predicate is evaluated against the statistical
        // estimate; the remaining four against raw statistics.
        let predicates = build_predicates(&stats, statistical, &threshold);
        let satisfied = predicates.iter().filter(|p| p.passed).count();
        let threshold_score = satisfied as f32 / predicates.len() as f32;

        let components = AlgorithmScores {
            statistical,
            threshold: threshold_score,
            ml_features,
            reranker_confidence,
        };
        let w = &config.weights;
        let confidence = (w.statistical * statistical
            + w.threshold * threshold_score
            + w.ml_features * ml_features
            + w.reranker_confidence * reranker_confidence)
            .clamp(0.0, 1.0);

        let failing: Vec<&Predicate> = predicates.iter().filter(|p| !p.passed).collect();
        let confidence_ok = confidence >= threshold.min_confidence;
        let hard_predicates_ok = predicates
            .iter()
            .filter(|p| p.name != "minConfidence")
            .all(|p| p.passed);
        let is_answerable = confidence_ok && hard_predicates_ok;

        let reasoning = if is_answerable {
            format!(
                "confidence {confidence:.2} >= {:.2}; all threshold predicates satisfied",
                threshold.min_confidence
            )
        } else {
            let mut parts: Vec<String> = Vec::new();
            if !confidence_ok {
                parts.push(format!(
                    "minConfidence ({confidence:.2} < {:.2})",
                    threshold.min_confidence
                ));
            }
            parts.extend(
                failing
                    .iter()
                    .filter(|p| p.name != "minConfidence")
                    .map(|p| format!("{} ({})", p.name, p.detail)),
            );
            format!("failed predicates: {}", parts.join("; "))
        };

        let idk_response = if is_answerable {
            None
        } else {
            // The first failing hard predicate names the reason; a pure
            // confidence failure maps to low_confidence.
            let reason_code = failing
                .iter()
                .find(|p| p.name != "minConfidence")
                .map(|p| p.reason_code)
                .unwrap_or("low_confidence")
                .to_string();
            Some(build_idk_response(config, &reason_code, confidence, results))
        };

        GuardrailDecision {
            is_answerable,
            decision: if is_answerable {
                DecisionType::Answerable
            } else {
                DecisionType::NotAnswerable
            },
            score: AnswerabilityScore {
                confidence,
                stats,
                components,
                reasoning,
                computation_time_ms: started.elapsed().as_millis() as u64,
            },
            threshold,
            idk_response,
        }
    }

    fn pass_through(
        decision: DecisionType,
        rationale: &str,
        threshold: AnswerabilityThreshold,
        started: Instant,
    ) -> GuardrailDecision {
        GuardrailDecision {
            is_answerable: true,
            decision,
            score: AnswerabilityScore {
                confidence: 1.0,
                stats: ScoreStatistics::default(),
                components: AlgorithmScores::default(),
                reasoning: rationale.to_string(),
                computation_time_ms: started.elapsed().as_millis() as u64,
            },
            threshold,
            idk_response: None,
        }
    }
}

impl Default for Guardrail {
    fn default() -> Self {
        Self::new()
    }
}

/// Blend of max and mean, penalized by spread and by very small result
/// counts.
fn statistical_score(stats: &ScoreStatistics) -> f32 {
    if stats.count == 0 {
        return 0.0;
    }
    let count_penalty = if stats.count < 3 {
        0.1 * (3 - stats.count) as f32
    } else {
        0.0
    };
    (0.55 * stats.max + 0.45 * stats.mean - 0.5 * stats.std_dev - count_penalty).clamp(0.0, 1.0)
}

/// Content heuristics on the top chunk: query-term coverage, presence of a
/// header, plausible length.
fn ml_features_score(query: &str, results: &[SearchResult]) -> f32 {
    let Some(top) = results.first() else { return 0.0 };

    let query_terms = tokenize(query);
    let coverage = if query_terms.is_empty() {
        0.0
    } else {
        let content_terms: std::collections::HashSet<String> =
            tokenize(&top.content).into_iter().collect();
        query_terms
            .iter()
            .filter(|t| content_terms.contains(*t))
            .count() as f32
            / query_terms.len() as f32
    };

    let has_header = top
        .payload
        .get("header")
        .and_then(|v| v.as_str())
        .map(|h| !h.is_empty())
        .unwrap_or(false);
    let chars = top.content.chars().count();
    let plausible_length = (100..=6000).contains(&chars);

    (0.5 * coverage
        + if has_header { 0.25 } else { 0.0 }
        + if plausible_length { 0.25 } else { 0.0 })
    .clamp(0.0, 1.0)
}

fn build_predicates(
    stats: &ScoreStatistics,
    provisional_confidence: f32,
    threshold: &AnswerabilityThreshold,
) -> Vec<Predicate> {
    vec![
        Predicate {
            name: "minConfidence",
            reason_code: "low_confidence",
            passed: provisional_confidence >= threshold.min_confidence,
            detail: format!("{provisional_confidence:.2} vs {:.2}", threshold.min_confidence),
        },
        Predicate {
            name: "minTopScore",
            reason_code: "low_top_score",
            passed: stats.max >= threshold.min_top_score,
            detail: format!("{:.2} < {:.2}", stats.max, threshold.min_top_score),
        },
        Predicate {
            name: "minMeanScore",
            reason_code: "low_mean_score",
            passed: stats.mean >= threshold.min_mean_score,
            detail: format!("{:.2} < {:.2}", stats.mean, threshold.min_mean_score),
        },
        Predicate {
            name: "maxStdDev",
            reason_code: "high_variance",
            passed: stats.std_dev <= threshold.max_std_dev,
            detail: format!("{:.2} > {:.2}", stats.std_dev, threshold.max_std_dev),
        },
        Predicate {
            name: "minResultCount",
            reason_code: "insufficient_results",
            passed: stats.count >= threshold.min_result_count,
            detail: format!("{} < {}", stats.count, threshold.min_result_count),
        },
    ]
}

const DEFAULT_IDK_MESSAGE: &str =
    "I don't have enough reliable information to answer that confidently.";

fn build_idk_response(
    config: &TenantGuardrailConfig,
    reason_code: &str,
    confidence: f32,
    rejected: &[SearchResult],
) -> IdkResponse {
    let message = config
        .idk_templates
        .iter()
        .find(|t| t.reason_code == reason_code)
        .map(|t| t.message.clone())
        .unwrap_or_else(|| DEFAULT_IDK_MESSAGE.to_string());

    let suggestions = match &config.fallback {
        Some(fallback) if fallback.suggestions_enabled => {
            let mut seen = std::collections::HashSet::new();
            rejected
                .iter()
                .filter(|r| r.score >= fallback.suggestion_threshold)
                .filter_map(|r| r.title().map(|t| t.to_string()))
                .filter(|t| seen.insert(t.to_lowercase()))
                .take(fallback.max_suggestions)
                .collect()
        }
        _ => Vec::new(),
    };

    IdkResponse {
        message,
        reason_code: reason_code.to_string(),
        suggestions,
        confidence_level: confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AlgorithmWeights, FallbackConfig, IdkTemplate, RetrievalConfig, TenantGuardrailConfig,
    };
    use crate::types::SearchType;
    use serde_json::json;

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            tenant_id: "acme".into(),
            group_ids: vec!["general".into()],
            language: None,
        }
    }

    fn guardrail_config(threshold: AnswerabilityThreshold) -> TenantGuardrailConfig {
        let mut config = TenantGuardrailConfig::defaults_for("acme", &RetrievalConfig::default());
        config.threshold = threshold;
        config.weights = AlgorithmWeights::default();
        config
    }

    fn result(id: &str, score: f32, content: &str) -> SearchResult {
        let mut r = SearchResult::new(id, score, SearchType::Hybrid);
        r.content = content.to_string();
        r.reranker_score = Some(score);
        r
    }

    fn strong_results() -> Vec<SearchResult> {
        let body = "Artificial intelligence overview with machine learning details. "
            .repeat(5);
        vec![
            result("a", 0.92, &body),
            result("b", 0.88, &body),
            result("c", 0.85, &body),
        ]
    }

    #[test]
    fn statistics_cover_moments_and_percentiles() {
        let stats = ScoreStatistics::from_scores(&[0.2, 0.4, 0.6, 0.8, 1.0]);
        assert!((stats.mean - 0.6).abs() < 1e-6);
        assert_eq!(stats.max, 1.0);
        assert_eq!(stats.min, 0.2);
        assert_eq!(stats.count, 5);
        assert!((stats.p50 - 0.6).abs() < 1e-6);
        assert!((stats.p25 - 0.4).abs() < 1e-6);
        assert!((stats.p90 - 0.92).abs() < 1e-6);
    }

    #[test]
    fn empty_scores_produce_zeroed_statistics() {
        let stats = ScoreStatistics::from_scores(&[]);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, 0.0);
    }

    #[test]
    fn strong_results_are_answerable_under_moderate_threshold() {
        let guardrail = Guardrail::new();
        let config = guardrail_config(AnswerabilityThreshold::moderate());
        let decision = guardrail.evaluate(
            "artificial intelligence machine learning",
            &strong_results(),
            &user(),
            &config,
            true,
        );
        assert!(decision.is_answerable);
        assert_eq!(decision.decision, DecisionType::Answerable);
        assert!(decision.idk_response.is_none());
        assert!(decision.score.confidence > 0.5);
    }

    #[test]
    fn weak_results_are_blocked_with_failing_predicates_in_reasoning() {
        let guardrail = Guardrail::new();
        let config = guardrail_config(AnswerabilityThreshold::strict());
        let weak = vec![result("a", 0.2, "unrelated text about cooking")];
        let decision = guardrail.evaluate("random unrelated topic", &weak, &user(), &config, false);

        assert!(!decision.is_answerable);
        assert_eq!(decision.decision, DecisionType::NotAnswerable);
        assert!(decision.score.reasoning.contains("minTopScore"));
        assert!(decision.score.reasoning.contains("minResultCount"));
        let idk = decision.idk_response.unwrap();
        assert!(!idk.message.is_empty());
        assert!(idk.confidence_level < config.threshold.min_confidence);
    }

    #[test]
    fn raising_min_confidence_never_unblocks() {
        let guardrail = Guardrail::new();
        let results = strong_results();

        let mut lenient = guardrail_config(AnswerabilityThreshold::moderate());
        lenient.threshold.min_confidence = 0.3;
        let mut strict = lenient.clone();
        strict.threshold.min_confidence = 0.9;

        let lenient_decision =
            guardrail.evaluate("machine learning", &results, &user(), &lenient, true);
        let strict_decision =
            guardrail.evaluate("machine learning", &results, &user(), &strict, true);

        // Monotone: whatever the strict threshold blocks, it can only be a
        // superset of what the lenient one blocks.
        if !lenient_decision.is_answerable {
            assert!(!strict_decision.is_answerable);
        }
    }

    #[test]
    fn disabled_guardrail_answers_with_rationale() {
        let guardrail = Guardrail::new();
        let mut config = guardrail_config(AnswerabilityThreshold::strict());
        config.enabled = false;
        let decision = guardrail.evaluate("anything", &[], &user(), &config, false);
        assert!(decision.is_answerable);
        assert_eq!(decision.decision, DecisionType::Disabled);
        assert_eq!(decision.score.reasoning, "GUARDRAIL_DISABLED");
    }

    #[test]
    fn bypass_applies_only_to_eligible_groups() {
        let guardrail = Guardrail::new();
        let mut config = guardrail_config(AnswerabilityThreshold::strict());
        config.bypass_enabled = true;
        config.bypass_groups = vec!["admin".into()];

        let mut admin = user();
        admin.group_ids = vec!["admin".into()];
        let decision = guardrail.evaluate("anything", &[], &admin, &config, false);
        assert_eq!(decision.decision, DecisionType::Bypassed);
        assert_eq!(decision.score.reasoning, "BYPASS_ENABLED");

        let decision = guardrail.evaluate("anything", &[], &user(), &config, false);
        assert_eq!(decision.decision, DecisionType::NotAnswerable);
    }

    #[test]
    fn idk_uses_matching_template_and_suggestions() {
        let guardrail = Guardrail::new();
        let mut config = guardrail_config(AnswerabilityThreshold::strict());
        config.idk_templates = vec![IdkTemplate {
            id: "t1".into(),
            reason_code: "low_top_score".into(),
            message: "Nothing in the corpus covers that topic.".into(),
        }];
        config.fallback = Some(FallbackConfig {
            suggestions_enabled: true,
            max_suggestions: 2,
            suggestion_threshold: 0.1,
        });

        let mut a = result("a", 0.4, "text");
        a.payload.insert("header".into(), json!("Billing Limits"));
        let mut b = result("b", 0.3, "text");
        b.payload.insert("header".into(), json!("Rate Cards"));
        let mut c = result("c", 0.3, "text");
        c.payload.insert("header".into(), json!("Archived Notes"));

        let decision = guardrail.evaluate("query terms", &[a, b, c], &user(), &config, false);
        let idk = decision.idk_response.unwrap();
        assert_eq!(idk.reason_code, "low_top_score");
        assert_eq!(idk.message, "Nothing in the corpus covers that topic.");
        assert_eq!(idk.suggestions, vec!["Billing Limits", "Rate Cards"]);
    }

    #[test]
    fn reranker_component_is_zero_when_reranking_skipped() {
        let guardrail = Guardrail::new();
        let config = guardrail_config(AnswerabilityThreshold::moderate());
        let decision =
            guardrail.evaluate("machine learning", &strong_results(), &user(), &config, false);
        assert_eq!(decision.score.components.reranker_confidence, 0.0);
    }
}
