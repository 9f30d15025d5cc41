//! Per-tenant corpus statistics: IDF, windowed co-occurrence, PMI.
//!
//! Statistics are derived from ingested text, persisted as one JSON file
//! per tenant under the data directory, cached in-process with a 24h TTL
//! and written through on update. The core never authors documents; it
//! only counts them.

pub mod alias;
pub mod keyphrase;
pub mod ranking;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::text::tokenize;

pub use alias::{AliasCluster, AliasClusterer};
pub use keyphrase::{extract_keyphrases, QueryPhrases};
pub use ranking::{
    coverage_features, exclusivity_penalty, keyword_points_score, present_mask, CoverageFeatures,
};

/// Terms co-occur when they appear within this many tokens of each other.
const COOCCURRENCE_WINDOW: usize = 8;

pub const STATS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    #[serde(default)]
    pub idf: HashMap<String, f64>,
    #[serde(default)]
    pub df: HashMap<String, u64>,
    #[serde(default)]
    pub cooc: HashMap<String, HashMap<String, u64>>,
    #[serde(default)]
    pub pmi: HashMap<String, HashMap<String, f64>>,
    #[serde(default)]
    pub total_docs: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl CorpusStats {
    pub fn idf_of(&self, term: &str) -> f64 {
        self.idf.get(term).copied().unwrap_or(1.0)
    }

    pub fn pmi_of(&self, a: &str, b: &str) -> f64 {
        self.pmi
            .get(a)
            .and_then(|inner| inner.get(b))
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn cooc_of(&self, a: &str, b: &str) -> u64 {
        self.cooc
            .get(a)
            .and_then(|inner| inner.get(b))
            .copied()
            .unwrap_or(0)
    }

    /// Fold a batch of tokenized documents into the counts, then recompute
    /// the derived IDF and PMI tables.
    fn absorb(&mut self, docs: &[Vec<String>]) {
        for tokens in docs {
            self.total_docs += 1;
            self.total_tokens += tokens.len() as u64;

            let unique: HashSet<&String> = tokens.iter().collect();
            for term in &unique {
                *self.df.entry((*term).clone()).or_insert(0) += 1;
            }

            for (i, a) in tokens.iter().enumerate() {
                let window_end = (i + 1 + COOCCURRENCE_WINDOW).min(tokens.len());
                for b in &tokens[i + 1..window_end] {
                    if a == b {
                        continue;
                    }
                    *self
                        .cooc
                        .entry(a.clone())
                        .or_default()
                        .entry(b.clone())
                        .or_insert(0) += 1;
                    *self
                        .cooc
                        .entry(b.clone())
                        .or_default()
                        .entry(a.clone())
                        .or_insert(0) += 1;
                }
            }
        }
        self.recompute_derived();
    }

    fn recompute_derived(&mut self) {
        let n = self.total_docs as f64;

        self.idf = self
            .df
            .iter()
            .map(|(term, &df)| (term.clone(), ((n + 1.0) / (df as f64 + 1.0)).ln() + 1.0))
            .collect();

        let mut pmi: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for (a, neighbors) in &self.cooc {
            let df_a = self.df.get(a).copied().unwrap_or(1).max(1) as f64;
            for (b, &count) in neighbors {
                let df_b = self.df.get(b).copied().unwrap_or(1).max(1) as f64;
                let value = ((count as f64 * n.max(1.0)) / (df_a * df_b)).log2();
                pmi.entry(a.clone()).or_default().insert(b.clone(), value);
            }
        }
        self.pmi = pmi;
    }
}

struct CachedStats {
    stats: Arc<CorpusStats>,
    loaded_at: Instant,
}

/// Owns the per-tenant statistics files and their in-process cache.
/// Readers share the cached `Arc`; updates take the writer lock, fold in
/// the new documents and replace the file atomically.
pub struct CorpusStatsStore {
    data_dir: PathBuf,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedStats>>,
}

impl CorpusStatsStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(data_dir, STATS_CACHE_TTL)
    }

    pub fn with_ttl(data_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn stats_path(&self, tenant_id: &str) -> PathBuf {
        self.data_dir.join(format!("corpus-stats-{tenant_id}.json"))
    }

    fn load_from_disk(&self, tenant_id: &str) -> CorpusStats {
        let path = self.stats_path(tenant_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(
                    tenant = %tenant_id,
                    path = %path.display(),
                    error = %e,
                    "corpus stats file is corrupt, starting empty"
                );
                CorpusStats::default()
            }),
            Err(_) => CorpusStats::default(),
        }
    }

    /// Lazy-loaded, TTL-cached read. Expired entries reload from disk.
    pub fn get(&self, tenant_id: &str) -> Arc<CorpusStats> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(tenant_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Arc::clone(&entry.stats);
                }
            }
        }

        let stats = Arc::new(self.load_from_disk(tenant_id));
        self.cache.write().insert(
            tenant_id.to_string(),
            CachedStats { stats: Arc::clone(&stats), loaded_at: Instant::now() },
        );
        stats
    }

    /// Fold ingested document texts into the tenant's statistics and write
    /// the file back atomically.
    pub fn update_corpus_stats(&self, docs: &[String], tenant_id: &str) -> Result<Arc<CorpusStats>> {
        let tokenized: Vec<Vec<String>> = docs.par_iter().map(|d| tokenize(d)).collect();

        let mut cache = self.cache.write();
        let mut stats = match cache.get(tenant_id) {
            Some(entry) if entry.loaded_at.elapsed() < self.ttl => (*entry.stats).clone(),
            _ => self.load_from_disk(tenant_id),
        };
        stats.absorb(&tokenized);

        self.persist(tenant_id, &stats)?;

        let stats = Arc::new(stats);
        cache.insert(
            tenant_id.to_string(),
            CachedStats { stats: Arc::clone(&stats), loaded_at: Instant::now() },
        );

        tracing::info!(
            tenant = %tenant_id,
            docs = docs.len(),
            total_docs = stats.total_docs,
            vocabulary = stats.idf.len(),
            "corpus stats updated"
        );
        Ok(stats)
    }

    /// Write-temp-then-rename so readers never observe a partial file.
    fn persist(&self, tenant_id: &str, stats: &CorpusStats) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;

        let path = self.stats_path(tenant_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string(stats).context("serializing corpus stats")?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Drop a tenant's cached entry. The next read reloads from disk.
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.write().remove(tenant_id);
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CorpusStatsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CorpusStatsStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn update_builds_idf_and_symmetric_cooccurrence() {
        let (_dir, store) = store();
        let docs = vec![
            "kubernetes cluster autoscaling policies".to_string(),
            "kubernetes cluster networking guide".to_string(),
            "espresso brewing temperature guide".to_string(),
        ];
        let stats = store.update_corpus_stats(&docs, "acme").unwrap();

        assert_eq!(stats.total_docs, 3);
        // "kubernetes" appears in 2 of 3 docs, "espresso" in 1.
        assert!(stats.idf_of("espresso") > stats.idf_of("kubernetes"));

        // Symmetric in key pair.
        assert_eq!(
            stats.cooc_of("kubernetes", "cluster"),
            stats.cooc_of("cluster", "kubernetes")
        );
        assert!(stats.cooc_of("kubernetes", "cluster") >= 2);

        let forward = stats.pmi_of("kubernetes", "cluster");
        let backward = stats.pmi_of("cluster", "kubernetes");
        assert!((forward - backward).abs() < 1e-9);
    }

    #[test]
    fn serialization_round_trips_exactly() {
        let (_dir, store) = store();
        let docs = vec![
            "vector retrieval with reciprocal rank fusion".to_string(),
            "lexical retrieval scoring notes".to_string(),
        ];
        let stats = store.update_corpus_stats(&docs, "acme").unwrap();

        let serialized = serde_json::to_string(&*stats).unwrap();
        let restored: CorpusStats = serde_json::from_str(&serialized).unwrap();
        assert_eq!(*stats, restored);
    }

    #[test]
    fn stats_persist_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CorpusStatsStore::new(dir.path());
            store
                .update_corpus_stats(&["alpha beta gamma".to_string()], "acme")
                .unwrap();
        }
        let store = CorpusStatsStore::new(dir.path());
        let stats = store.get("acme");
        assert_eq!(stats.total_docs, 1);
        assert!(stats.idf.contains_key("alpha"));
    }

    #[test]
    fn unknown_tenant_reads_empty_stats() {
        let (_dir, store) = store();
        let stats = store.get("nobody");
        assert_eq!(stats.total_docs, 0);
        assert!(stats.idf.is_empty());
    }

    #[test]
    fn ttl_expiry_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CorpusStatsStore::with_ttl(dir.path(), Duration::from_millis(0));
        store
            .update_corpus_stats(&["alpha beta".to_string()], "acme")
            .unwrap();

        // Replace the file behind the cache's back; a zero TTL must force a
        // reload on the next read.
        let other = CorpusStatsStore::new(dir.path());
        other
            .update_corpus_stats(&["gamma delta epsilon".to_string()], "acme")
            .unwrap();

        let stats = store.get("acme");
        assert_eq!(stats.total_docs, 2);
    }

    #[test]
    fn updates_accumulate_across_calls() {
        let (_dir, store) = store();
        store
            .update_corpus_stats(&["first document text".to_string()], "acme")
            .unwrap();
        let stats = store
            .update_corpus_stats(&["second document text".to_string()], "acme")
            .unwrap();
        assert_eq!(stats.total_docs, 2);
        assert_eq!(stats.df.get("document"), Some(&2));
        assert_eq!(stats.df.get("first"), Some(&1));
    }
}
