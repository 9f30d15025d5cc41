//! Alias clustering: group a phrase with the terms the corpus and the
//! embedding space both treat as the same thing.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::CorpusStats;
use crate::config::AliasConfig;
use crate::embeddings::{cosine_similarity, Embedder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasCluster {
    pub center: String,
    pub members: Vec<String>,
}

impl AliasCluster {
    fn singleton(center: &str) -> Self {
        Self {
            center: center.to_string(),
            members: vec![center.to_string()],
        }
    }
}

/// Collects candidate aliases from high-PMI neighbors, keeps those the
/// embedder agrees with (cosine at or above the configured threshold), and
/// caches clusters per tenant for an hour. An embedder failure degrades to
/// a singleton cluster.
pub struct AliasClusterer {
    embedder: Arc<dyn Embedder>,
    config: AliasConfig,
    cache: Mutex<LruCache<String, (AliasCluster, Instant)>>,
}

impl AliasClusterer {
    pub fn new(embedder: Arc<dyn Embedder>, config: AliasConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            embedder,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn cluster(
        &self,
        tenant_id: &str,
        phrase: &str,
        stats: &CorpusStats,
    ) -> AliasCluster {
        let key = format!("{tenant_id}:{}", phrase.to_lowercase());
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some((cluster, at)) = self.cache.lock().get(&key) {
            if at.elapsed() < ttl {
                return cluster.clone();
            }
        }

        let cluster = self.build_cluster(phrase, stats).await;
        self.cache.lock().put(key, (cluster.clone(), Instant::now()));
        cluster
    }

    async fn build_cluster(&self, phrase: &str, stats: &CorpusStats) -> AliasCluster {
        let candidates = self.pmi_neighbors(phrase, stats);
        if candidates.is_empty() {
            return AliasCluster::singleton(phrase);
        }

        let mut inputs: Vec<String> = Vec::with_capacity(candidates.len() + 1);
        inputs.push(phrase.to_string());
        inputs.extend(candidates.iter().cloned());

        let vectors = match self.embedder.embed_batch(&inputs).await {
            Ok(v) if v.len() == inputs.len() => v,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    phrase = %phrase,
                    "embedder unavailable for alias clustering, returning singleton"
                );
                return AliasCluster::singleton(phrase);
            }
        };

        let center_vector = &vectors[0];
        let mut members = vec![phrase.to_string()];
        for (candidate, vector) in candidates.iter().zip(&vectors[1..]) {
            if cosine_similarity(center_vector, vector) >= self.config.emb_sim_tau {
                members.push(candidate.clone());
            }
        }

        // Case-insensitive dedup, first occurrence wins.
        let mut seen = std::collections::HashSet::new();
        members.retain(|m| seen.insert(m.to_lowercase()));

        AliasCluster { center: phrase.to_string(), members }
    }

    /// Candidate aliases: PMI neighbors of any token of the phrase, above
    /// the PMI threshold, strongest association first.
    fn pmi_neighbors(&self, phrase: &str, stats: &CorpusStats) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = Vec::new();
        for token in crate::text::tokenize(phrase) {
            if let Some(neighbors) = stats.pmi.get(&token) {
                for (neighbor, &pmi) in neighbors {
                    if pmi >= self.config.pmi_sim_tau && neighbor != &token {
                        scored.push((neighbor.clone(), pmi));
                    }
                }
            }
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let mut seen = std::collections::HashSet::new();
        scored.retain(|(term, _)| seen.insert(term.clone()));
        scored.truncate(16);
        scored.into_iter().map(|(term, _)| term).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrievalError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MappedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        fail: bool,
    }

    #[async_trait]
    impl Embedder for MappedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
            if self.fail {
                return Err(RetrievalError::EmbeddingUnavailable("down".into()));
            }
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![1.0, 0.0, 0.0]))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            3
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    fn stats_with_neighbors(center: &str, neighbors: &[(&str, f64)]) -> CorpusStats {
        let mut stats = CorpusStats::default();
        let inner: HashMap<String, f64> = neighbors
            .iter()
            .map(|(t, v)| (t.to_string(), *v))
            .collect();
        stats.pmi.insert(center.to_string(), inner);
        stats
    }

    fn config() -> AliasConfig {
        AliasConfig {
            emb_sim_tau: 0.9,
            pmi_sim_tau: 2.0,
            cache_ttl_secs: 3600,
            cache_capacity: 8,
        }
    }

    #[tokio::test]
    async fn high_pmi_and_high_cosine_neighbors_join_the_cluster() {
        let mut vectors = HashMap::new();
        vectors.insert("kubernetes".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("k8s".to_string(), vec![0.99, 0.1, 0.0]);
        vectors.insert("espresso".to_string(), vec![0.0, 1.0, 0.0]);

        let stats = stats_with_neighbors("kubernetes", &[("k8s", 4.0), ("espresso", 3.0)]);
        let clusterer = AliasClusterer::new(
            Arc::new(MappedEmbedder { vectors, fail: false }),
            config(),
        );

        let cluster = clusterer.cluster("acme", "kubernetes", &stats).await;
        assert_eq!(cluster.center, "kubernetes");
        assert!(cluster.members.contains(&"k8s".to_string()));
        assert!(!cluster.members.contains(&"espresso".to_string()));
    }

    #[tokio::test]
    async fn low_pmi_neighbors_are_never_candidates() {
        let stats = stats_with_neighbors("kubernetes", &[("weather", 0.2)]);
        let clusterer = AliasClusterer::new(
            Arc::new(MappedEmbedder { vectors: HashMap::new(), fail: false }),
            config(),
        );
        let cluster = clusterer.cluster("acme", "kubernetes", &stats).await;
        assert_eq!(cluster.members, vec!["kubernetes"]);
    }

    #[tokio::test]
    async fn embedder_failure_degrades_to_singleton() {
        let stats = stats_with_neighbors("kubernetes", &[("k8s", 4.0)]);
        let clusterer = AliasClusterer::new(
            Arc::new(MappedEmbedder { vectors: HashMap::new(), fail: true }),
            config(),
        );
        let cluster = clusterer.cluster("acme", "kubernetes", &stats).await;
        assert_eq!(cluster.members, vec!["kubernetes"]);
    }

    #[tokio::test]
    async fn clusters_are_cached_per_tenant_and_phrase() {
        let stats = stats_with_neighbors("kubernetes", &[("k8s", 4.0)]);
        let mut vectors = HashMap::new();
        vectors.insert("kubernetes".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("k8s".to_string(), vec![1.0, 0.0, 0.0]);
        let clusterer = AliasClusterer::new(
            Arc::new(MappedEmbedder { vectors, fail: false }),
            config(),
        );

        let first = clusterer.cluster("acme", "Kubernetes", &stats).await;
        // Cached under the lowercase key; an empty-stats call would
        // otherwise produce a singleton.
        let second = clusterer
            .cluster("acme", "kubernetes", &CorpusStats::default())
            .await;
        assert_eq!(first, second);
    }
}
