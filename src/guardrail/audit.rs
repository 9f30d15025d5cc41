//! Best-effort audit trail. Records are handed to a background writer over
//! a channel; emitting one never blocks or fails the request path.

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DecisionType, GuardrailDecision, ScoreStatistics};
use crate::types::UserContext;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyBreakdown {
    pub retrieval_ms: u64,
    pub guardrail_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// `decision` or `error`.
    pub record_type: String,
    pub query: String,
    pub tenant_id: String,
    pub user_id: String,
    pub result_count: usize,
    #[serde(default)]
    pub stats_summary: Option<ScoreStatistics>,
    pub decision: String,
    #[serde(default)]
    pub reason_code: Option<String>,
    pub decision_rationale: String,
    pub latency: LatencyBreakdown,
}

impl AuditRecord {
    pub fn for_decision(
        decision: &GuardrailDecision,
        query: &str,
        user: &UserContext,
        result_count: usize,
        latency: LatencyBreakdown,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            record_type: "decision".to_string(),
            query: query.to_string(),
            tenant_id: user.tenant_id.clone(),
            user_id: user.id.clone(),
            result_count,
            stats_summary: Some(decision.score.stats),
            decision: decision.decision.as_str().to_string(),
            reason_code: decision
                .idk_response
                .as_ref()
                .map(|idk| idk.reason_code.clone()),
            decision_rationale: decision.score.reasoning.clone(),
            latency,
        }
    }

    pub fn for_error(query: &str, user: &UserContext, error: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            record_type: "error".to_string(),
            query: query.to_string(),
            tenant_id: user.tenant_id.clone(),
            user_id: user.id.clone(),
            result_count: 0,
            stats_summary: None,
            decision: DecisionType::NotAnswerable.as_str().to_string(),
            reason_code: Some("evaluation_error".to_string()),
            decision_rationale: error.to_string(),
            latency: LatencyBreakdown::default(),
        }
    }
}

enum Sink {
    File(mpsc::Sender<AuditRecord>),
    TracingOnly,
}

/// Non-blocking audit writer. A dedicated thread appends JSON lines to
/// `audit.log` under the data directory; every record is also mirrored as
/// a structured tracing event.
pub struct AuditLog {
    sink: Sink,
}

impl AuditLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let (tx, rx) = mpsc::channel::<AuditRecord>();

        std::thread::spawn(move || {
            let path = data_dir.join("audit.log");
            if std::fs::create_dir_all(&data_dir).is_err() {
                tracing::warn!(dir = %data_dir.display(), "audit dir not writable");
            }
            while let Ok(record) = rx.recv() {
                let Ok(line) = serde_json::to_string(&record) else { continue };
                let appended = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut file| writeln!(file, "{line}"));
                if let Err(e) = appended {
                    tracing::warn!(error = %e, "audit write failed");
                }
            }
        });

        Self { sink: Sink::File(tx) }
    }

    /// Tracing-only sink for embedders and tests.
    pub fn tracing_only() -> Self {
        Self { sink: Sink::TracingOnly }
    }

    pub fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            tenant = %record.tenant_id,
            user = %record.user_id,
            decision = %record.decision,
            reason = record.reason_code.as_deref().unwrap_or(""),
            results = record.result_count,
            "guardrail decision"
        );
        if let Sink::File(tx) = &self.sink {
            // A full or closed channel is the writer's problem, not ours.
            let _ = tx.send(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnswerabilityThreshold;
    use crate::guardrail::{AlgorithmScores, AnswerabilityScore};
    use std::time::Duration;

    fn decision() -> GuardrailDecision {
        GuardrailDecision {
            is_answerable: false,
            decision: DecisionType::NotAnswerable,
            score: AnswerabilityScore {
                confidence: 0.2,
                stats: ScoreStatistics::default(),
                components: AlgorithmScores::default(),
                reasoning: "failed predicates: minTopScore (0.20 < 0.70)".into(),
                computation_time_ms: 3,
            },
            threshold: AnswerabilityThreshold::strict(),
            idk_response: Some(crate::guardrail::IdkResponse {
                message: "no".into(),
                reason_code: "low_top_score".into(),
                suggestions: vec![],
                confidence_level: 0.2,
            }),
        }
    }

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            tenant_id: "acme".into(),
            group_ids: vec![],
            language: None,
        }
    }

    #[test]
    fn decision_record_carries_reason_and_rationale() {
        let record = AuditRecord::for_decision(
            &decision(),
            "some query",
            &user(),
            0,
            LatencyBreakdown { retrieval_ms: 12, guardrail_ms: 3, total_ms: 15 },
        );
        assert_eq!(record.record_type, "decision");
        assert_eq!(record.decision, "not_answerable");
        assert_eq!(record.reason_code.as_deref(), Some("low_top_score"));
        assert!(record.decision_rationale.contains("minTopScore"));
        assert!(record.timestamp.contains('T'));
    }

    #[test]
    fn records_land_in_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.record(AuditRecord::for_error("q", &user(), "embedding unavailable"));

        let path = dir.path().join("audit.log");
        let mut content = String::new();
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(10));
            content = std::fs::read_to_string(&path).unwrap_or_default();
            if !content.is_empty() {
                break;
            }
        }
        let record: AuditRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record.record_type, "error");
        assert_eq!(record.reason_code.as_deref(), Some("evaluation_error"));
    }

    #[test]
    fn tracing_only_sink_never_touches_disk() {
        let log = AuditLog::tracing_only();
        log.record(AuditRecord::for_error("q", &user(), "boom"));
    }
}
