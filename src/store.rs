//! Interface to the external dense store and keyword index.
//!
//! The core never owns the collection; it consumes a vector-search +
//! point-scroll API over a tenant-scoped collection. Production plugs in an
//! HTTP-backed implementation; tests plug in in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Payload, UserContext};

/// One match condition on an indexed payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Match {
    /// Exact scalar equality.
    Value(serde_json::Value),
    /// Membership: field (scalar or array) intersects any of these values.
    Any(Vec<String>),
    /// Full-text containment on the field.
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub key: String,
    #[serde(rename = "match")]
    pub matches: Match,
}

impl FieldCondition {
    pub fn value(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self { key: key.into(), matches: Match::Value(value.into()) }
    }

    pub fn any(key: impl Into<String>, values: Vec<String>) -> Self {
        Self { key: key.into(), matches: Match::Any(values) }
    }

    pub fn text(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self { key: key.into(), matches: Match::Text(text.into()) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<FieldCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<FieldCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<FieldCondition>,
}

impl Filter {
    /// Tenant + ACL filter attached to every outbound retrieval call.
    /// The ACL clause admits the caller's groups plus `"public"`.
    pub fn rbac(user: &UserContext) -> Self {
        Self {
            must: vec![
                FieldCondition::value("tenant", user.tenant_id.clone()),
                FieldCondition::any("acl", user.acl_principals()),
            ],
            should: Vec::new(),
            must_not: Vec::new(),
        }
    }

    pub fn with_must(mut self, condition: FieldCondition) -> Self {
        self.must.push(condition);
        self
    }

    pub fn with_should(mut self, condition: FieldCondition) -> Self {
        self.should.push(condition);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollPoint {
    pub id: String,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollOptions {
    pub limit: usize,
    pub with_payload: bool,
    pub with_vector: bool,
}

impl ScrollOptions {
    pub fn payload_only(limit: usize) -> Self {
        Self { limit, with_payload: true, with_vector: false }
    }
}

/// The dense store plus its point-scroll API. The keyword channel and the
/// section fetcher both ride on `scroll`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> anyhow::Result<Vec<ScoredPoint>>;

    async fn scroll(
        &self,
        collection: &str,
        filter: &Filter,
        options: ScrollOptions,
    ) -> anyhow::Result<Vec<ScrollPoint>>;
}

/// Payload-side filter evaluation, shared by in-process fakes and the
/// keyword scorer's post-filtering.
pub fn payload_matches(filter: &Filter, payload: &Payload) -> bool {
    let check = |cond: &FieldCondition| -> bool {
        let field = payload.get(&cond.key);
        match &cond.matches {
            Match::Value(expected) => field == Some(expected),
            Match::Any(values) => match field {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .any(|s| values.iter().any(|v| v == s)),
                Some(serde_json::Value::String(s)) => values.iter().any(|v| v == s),
                _ => false,
            },
            Match::Text(needle) => field
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
        }
    };

    filter.must.iter().all(check)
        && filter.must_not.iter().all(|c| !check(c))
        && (filter.should.is_empty() || filter.should.iter().any(check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Payload {
        let mut p = Payload::new();
        p.insert("tenant".into(), json!("acme"));
        p.insert("acl".into(), json!(["engineering", "public"]));
        p.insert("content".into(), json!("Latency targets for the API tier"));
        p
    }

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            tenant_id: "acme".into(),
            group_ids: vec!["engineering".into()],
            language: None,
        }
    }

    #[test]
    fn rbac_filter_carries_tenant_and_acl() {
        let filter = Filter::rbac(&user());
        assert_eq!(filter.must.len(), 2);
        assert!(payload_matches(&filter, &payload()));
    }

    #[test]
    fn rbac_filter_rejects_other_tenant() {
        let filter = Filter::rbac(&user());
        let mut other = payload();
        other.insert("tenant".into(), json!("globex"));
        assert!(!payload_matches(&filter, &other));
    }

    #[test]
    fn rbac_filter_rejects_disjoint_acl() {
        let mut restricted = payload();
        restricted.insert("acl".into(), json!(["research", "advanced"]));
        let filter = Filter::rbac(&user());
        assert!(!payload_matches(&filter, &restricted));
    }

    #[test]
    fn should_clauses_require_at_least_one_hit() {
        let filter = Filter::default()
            .with_should(FieldCondition::text("content", "latency"))
            .with_should(FieldCondition::text("content", "nonexistent"));
        assert!(payload_matches(&filter, &payload()));

        let filter = Filter::default().with_should(FieldCondition::text("content", "nonexistent"));
        assert!(!payload_matches(&filter, &payload()));
    }

    #[test]
    fn filter_serializes_wire_shape() {
        let filter = Filter::rbac(&user());
        let wire = serde_json::to_value(&filter).unwrap();
        assert_eq!(wire["must"][0]["key"], "tenant");
        assert!(wire["must"][1]["match"]["any"].is_array());
    }
}
