use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form per-chunk fields used for filters and display.
pub type Payload = HashMap<String, serde_json::Value>;

/// Caller identity attached to every search. An empty `id` or `tenant_id`
/// is rejected as unauthorized before any retrieval happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl UserContext {
    /// ACL principals this caller may read: their groups plus `"public"`.
    pub fn acl_principals(&self) -> Vec<String> {
        let mut principals = self.group_ids.clone();
        if !principals.iter().any(|g| g == "public") {
            principals.push("public".to_string());
        }
        principals
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    #[serde(default)]
    pub vector_weight: Option<f32>,
    #[serde(default)]
    pub keyword_weight: Option<f32>,
    #[serde(default)]
    pub rrf_k: Option<u32>,
    #[serde(default)]
    pub enable_keyword_search: Option<bool>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Optional space filter applied to both retrieval channels.
    #[serde(default)]
    pub space_ids: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            vector_weight: None,
            keyword_weight: None,
            rrf_k: None,
            enable_keyword_search: None,
            tenant_id: None,
            space_ids: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    VectorOnly,
    KeywordOnly,
    Hybrid,
    SectionRelated,
    SectionReconstructed,
}

/// Per-candidate record flowing through the pipeline. The primary `score`
/// is whatever the latest stage produced; the per-channel scores are kept
/// so traces and tests can reconstruct every decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub vector_score: Option<f32>,
    #[serde(default)]
    pub keyword_score: Option<f32>,
    #[serde(default)]
    pub fusion_score: Option<f32>,
    #[serde(default)]
    pub reranker_score: Option<f32>,
    /// Pre-reranker score, preserved when the reranker rewrites `score`.
    #[serde(default)]
    pub original_score: Option<f32>,
    #[serde(default)]
    pub rank: Option<usize>,
    pub search_type: SearchType,
    pub content: String,
    #[serde(default)]
    pub payload: Payload,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, score: f32, search_type: SearchType) -> Self {
        Self {
            id: id.into(),
            score,
            vector_score: None,
            keyword_score: None,
            fusion_score: None,
            reranker_score: None,
            original_score: None,
            rank: None,
            search_type,
            content: String::new(),
            payload: Payload::new(),
        }
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.payload_str("docId")
    }

    pub fn tenant(&self) -> Option<&str> {
        self.payload_str("tenant")
    }

    pub fn section_path(&self) -> Option<&str> {
        self.payload_str("sectionPath")
    }

    pub fn space_id(&self) -> Option<&str> {
        self.payload_str("spaceId")
    }

    /// Title-like field for suggestions and field boosts: `header`, then
    /// `title`, then the document id.
    pub fn title(&self) -> Option<&str> {
        self.payload_str("header")
            .or_else(|| self.payload_str("title"))
            .or_else(|| self.doc_id())
    }

    pub fn acl(&self) -> Vec<String> {
        match self.payload.get("acl") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Per-stage timing and counts returned with every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetrics {
    pub vector_search_duration_ms: u64,
    pub keyword_search_duration_ms: u64,
    pub fusion_duration_ms: u64,
    pub reranker_duration_ms: u64,
    #[serde(default)]
    pub guardrail_duration_ms: Option<u64>,
    pub total_duration_ms: u64,
    pub vector_result_count: usize,
    pub keyword_result_count: usize,
    pub final_result_count: usize,
    pub reranking_enabled: bool,
    pub documents_reranked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn acl_principals_always_include_public() {
        let user = UserContext {
            id: "u1".into(),
            tenant_id: "acme".into(),
            group_ids: vec!["engineering".into()],
            language: None,
        };
        assert_eq!(user.acl_principals(), vec!["engineering", "public"]);
    }

    #[test]
    fn payload_accessors_read_expected_keys() {
        let mut result = SearchResult::new("c1", 0.9, SearchType::Hybrid);
        result.payload.insert("docId".into(), json!("doc-7"));
        result.payload.insert("sectionPath".into(), json!("block_9/part_2"));
        result.payload.insert("acl".into(), json!(["engineering", "public"]));
        result.payload.insert("header".into(), json!("Quarterly Limits"));

        assert_eq!(result.doc_id(), Some("doc-7"));
        assert_eq!(result.section_path(), Some("block_9/part_2"));
        assert_eq!(result.acl(), vec!["engineering", "public"]);
        assert_eq!(result.title(), Some("Quarterly Limits"));
    }

    #[test]
    fn search_type_serializes_snake_case() {
        let tagged = serde_json::to_string(&SearchType::SectionReconstructed).unwrap();
        assert_eq!(tagged, "\"section_reconstructed\"");
    }
}
