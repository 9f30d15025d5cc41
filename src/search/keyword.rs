//! Lexical retrieval channel. Rides on the store's point-scroll API with a
//! tenant + ACL filter and scores candidates client-side by keyword
//! occurrence, BM25-shaped.

use std::sync::Arc;

use anyhow::Result;

use crate::stats::CorpusStats;
use crate::store::{FieldCondition, Filter, ScrollOptions, VectorStore};
use crate::text::{term_frequency, tokenize};
use crate::types::{SearchResult, SearchType, UserContext};

#[derive(Debug, Clone)]
pub struct KeywordSearchOptions {
    pub limit: usize,
    pub space_ids: Option<Vec<String>>,
    /// When domainless ranking is on, over-fetch so the re-scorer has room.
    pub domainless: bool,
    /// IDF at or above which a term counts as high-value.
    pub high_value_idf: f64,
}

pub struct KeywordSearcher {
    store: Arc<dyn VectorStore>,
}

impl KeywordSearcher {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        user: &UserContext,
        stats: &CorpusStats,
        options: &KeywordSearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut filter = Filter::rbac(user);
        if let Some(space_ids) = &options.space_ids {
            if !space_ids.is_empty() {
                filter = filter.with_must(FieldCondition::any("spaceId", space_ids.clone()));
            }
        }
        for term in &terms {
            filter = filter
                .with_should(FieldCondition::text("content", term.clone()))
                .with_should(FieldCondition::text("header", term.clone()));
        }

        let fetch_limit = if options.domainless {
            options.limit * 2
        } else {
            options.limit
        };

        let points = self
            .store
            .scroll(collection, &filter, ScrollOptions::payload_only(fetch_limit))
            .await?;

        let mut results: Vec<SearchResult> = points
            .into_iter()
            .map(|point| {
                let content = point
                    .payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let header = point
                    .payload
                    .get("header")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                let score = score_chunk(&content, &header, &terms, stats, options.high_value_idf);
                let mut result = SearchResult::new(point.id, score, SearchType::KeywordOnly);
                result.keyword_score = Some(score);
                result.content = content;
                result.payload = point.payload;
                result
            })
            .filter(|r| r.score > 0.0)
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(options.limit);
        Ok(results)
    }
}

/// BM25-shaped per-chunk score: summed term-frequency times term importance
/// times 0.3, boosted for high-value terms, perfect coverage and known
/// co-occurring pairs, capped at 1.0.
pub fn score_chunk(
    content: &str,
    header: &str,
    terms: &[String],
    stats: &CorpusStats,
    high_value_idf: f64,
) -> f32 {
    let haystack = if header.is_empty() {
        content.to_string()
    } else {
        format!("{header}\n{content}")
    };

    let mut score = 0.0f32;
    let mut present: Vec<&String> = Vec::new();
    for term in terms {
        let tf = term_frequency(&haystack, term);
        if tf == 0 {
            continue;
        }
        present.push(term);
        score += tf as f32 * stats.idf_of(term) as f32 * 0.3;
    }

    if present.is_empty() {
        return 0.0;
    }

    if present.iter().any(|t| stats.idf_of(t) >= high_value_idf) {
        score *= 1.2;
    }
    if present.len() == terms.len() && terms.len() > 1 {
        score *= 1.25;
    }
    if has_co_term_pair(&present, stats) {
        score *= 1.1;
    }

    score.min(1.0)
}

/// A pair of present query terms the corpus already knows belong together.
fn has_co_term_pair(present: &[&String], stats: &CorpusStats) -> bool {
    for (i, a) in present.iter().enumerate() {
        for b in &present[i + 1..] {
            if stats.pmi_of(a, b) >= 1.0 || stats.cooc_of(a, b) >= 2 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{payload_matches, ScoredPoint, ScrollPoint};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeStore {
        points: Vec<ScrollPoint>,
    }

    #[async_trait]
    impl VectorStore for FakeStore {
        async fn search(
            &self,
            _collection: &str,
            _query_vector: &[f32],
            _limit: usize,
            _filter: &Filter,
        ) -> Result<Vec<ScoredPoint>> {
            Ok(Vec::new())
        }

        async fn scroll(
            &self,
            _collection: &str,
            filter: &Filter,
            options: ScrollOptions,
        ) -> Result<Vec<ScrollPoint>> {
            Ok(self
                .points
                .iter()
                .filter(|p| payload_matches(filter, &p.payload))
                .take(options.limit)
                .cloned()
                .collect())
        }
    }

    fn point(id: &str, tenant: &str, acl: &[&str], content: &str) -> ScrollPoint {
        let mut payload = HashMap::new();
        payload.insert("tenant".to_string(), json!(tenant));
        payload.insert("acl".to_string(), json!(acl));
        payload.insert("content".to_string(), json!(content));
        ScrollPoint { id: id.to_string(), payload }
    }

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            tenant_id: "acme".into(),
            group_ids: vec!["general".into()],
            language: None,
        }
    }

    fn options(limit: usize) -> KeywordSearchOptions {
        KeywordSearchOptions {
            limit,
            space_ids: None,
            domainless: false,
            high_value_idf: 2.5,
        }
    }

    #[tokio::test]
    async fn stop_word_only_query_returns_empty() {
        let searcher = KeywordSearcher::new(Arc::new(FakeStore { points: vec![] }));
        let results = searcher
            .search("docs", "the of and", &user(), &CorpusStats::default(), &options(5))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn matching_chunks_outrank_non_matching() {
        let store = FakeStore {
            points: vec![
                point("good", "acme", &["public"], "database replication lag metrics"),
                point("weak", "acme", &["public"], "replication overview"),
            ],
        };
        let searcher = KeywordSearcher::new(Arc::new(store));
        let results = searcher
            .search(
                "docs",
                "replication lag",
                &user(),
                &CorpusStats::default(),
                &options(5),
            )
            .await
            .unwrap();
        assert_eq!(results[0].id, "good");
        assert_eq!(results[0].search_type, SearchType::KeywordOnly);
        assert!(results[0].keyword_score.unwrap() > results[1].keyword_score.unwrap());
    }

    #[tokio::test]
    async fn other_tenant_chunks_never_surface() {
        let store = FakeStore {
            points: vec![point("foreign", "globex", &["public"], "replication lag")],
        };
        let searcher = KeywordSearcher::new(Arc::new(store));
        let results = searcher
            .search("docs", "replication lag", &user(), &CorpusStats::default(), &options(5))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn perfect_coverage_beats_partial_coverage() {
        let stats = CorpusStats::default();
        let terms = vec!["replication".to_string(), "lag".to_string()];
        let full = score_chunk("replication lag details", "", &terms, &stats, 2.5);
        let partial = score_chunk("replication details", "", &terms, &stats, 2.5);
        assert!(full > partial);
    }

    #[test]
    fn high_value_term_multiplier_applies() {
        let mut stats = CorpusStats::default();
        stats.idf.insert("zookeeper".into(), 3.0);
        let terms = vec!["zookeeper".to_string()];
        let boosted = score_chunk("zookeeper quorum", "", &terms, &stats, 2.5);

        let mut plain_stats = CorpusStats::default();
        plain_stats.idf.insert("zookeeper".into(), 1.0);
        let plain = score_chunk("zookeeper quorum", "", &terms, &plain_stats, 2.5);
        assert!(boosted > plain);
    }

    #[test]
    fn score_is_capped_at_one() {
        let mut stats = CorpusStats::default();
        stats.idf.insert("kafka".into(), 4.0);
        let terms = vec!["kafka".to_string()];
        let score = score_chunk(&"kafka ".repeat(50), "", &terms, &stats, 2.5);
        assert!(score <= 1.0);
    }
}
