use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::RetrievalError;

/// Root configuration. Every knob is a typed field; the env-var table maps
/// onto it at startup via [`RetrievalConfig::apply_env`]. Validation runs on
/// write so query-time code can assume structural correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchDefaults,
    pub reranker: RerankerConfig,
    pub sections: SectionConfig,
    pub packing: PackingConfig,
    pub guardrail: GuardrailDefaults,
    pub features: FeatureFlags,
    pub timeouts: StageTimeouts,
    pub query_cache: QueryCacheConfig,
    pub alias: AliasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub dimension: usize,
    pub max_tokens: usize,
    pub safety_margin: f32,
    /// Bounded LRU of query-text embeddings.
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub strategy: String,
    pub max_tokens: usize,
    pub safety_margin: f32,
    pub overlap_tokens: usize,
    /// Estimated characters per token for the active counter.
    pub chars_per_token: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDefaults {
    pub retrieval_k: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: u32,
    pub fusion_strategy: String,
    pub normalization: String,
    pub keyword_search_enabled: bool,
    /// IDF at or above which a term counts as high-value for keyword boosts
    /// and as "rare" for adaptive weighting.
    pub high_value_idf: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub top_n_in: usize,
    pub top_n_out: usize,
    pub score_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionConfig {
    pub enabled: bool,
    /// Best member score a group needs before reconstruction triggers.
    pub min_trigger_score: f32,
    pub min_trigger_chunks: usize,
    pub max_chunks_per_section: usize,
    pub fetch_timeout_ms: u64,
    pub combine_strategy: String,
    pub merge_mode: String,
    pub dedupe_lines: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingConfig {
    pub max_context_tokens: usize,
    pub per_doc_cap: usize,
    pub per_section_cap: usize,
    pub mmr_alpha: f32,
    pub answerability_bonus_cap: f32,
    pub section_reunion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailDefaults {
    pub enabled: bool,
    pub min_quality_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub features_enabled: bool,
    pub domainless_ranking: bool,
    pub mmr_enabled: bool,
    pub query_adaptive_weights: bool,
    pub kw_points_enabled: bool,
    pub fusion_debug_trace: bool,
    pub deduplication: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub vector_ms: u64,
    pub keyword_ms: u64,
    pub reranker_ms: u64,
    pub embedding_ms: u64,
    pub overall_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasConfig {
    /// Embedding-cosine threshold for alias membership.
    pub emb_sim_tau: f32,
    /// PMI threshold for alias membership.
    pub pmi_sim_tau: f64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("khoj-retrieval");

        Self {
            data_dir,
            embedding: EmbeddingConfig {
                endpoint: "http://localhost:8080/embed".into(),
                dimension: 384,
                max_tokens: 512,
                safety_margin: 0.1,
                cache_size: 1024,
            },
            chunking: ChunkingConfig {
                strategy: "token_aware".into(),
                max_tokens: 512,
                safety_margin: 0.1,
                overlap_tokens: 0,
                chars_per_token: 3.2,
            },
            search: SearchDefaults {
                retrieval_k: 12,
                vector_weight: 0.7,
                keyword_weight: 0.3,
                rrf_k: 60,
                fusion_strategy: "score_weighted_rrf".into(),
                normalization: "minmax".into(),
                keyword_search_enabled: true,
                high_value_idf: 2.5,
            },
            reranker: RerankerConfig {
                enabled: false,
                endpoint: "http://localhost:8081/rerank".into(),
                model: "cross-encoder/ms-marco-MiniLM-L6-v2".into(),
                batch_size: 16,
                timeout_ms: 500,
                top_n_in: 20,
                top_n_out: 8,
                score_threshold: 0.0,
            },
            sections: SectionConfig {
                enabled: true,
                min_trigger_score: 0.6,
                min_trigger_chunks: 1,
                max_chunks_per_section: 10,
                fetch_timeout_ms: 2000,
                combine_strategy: "weighted_average".into(),
                merge_mode: "replace".into(),
                dedupe_lines: true,
            },
            packing: PackingConfig {
                max_context_tokens: 8000,
                per_doc_cap: 2,
                per_section_cap: 2,
                mmr_alpha: 0.5,
                answerability_bonus_cap: 0.2,
                section_reunion: true,
            },
            guardrail: GuardrailDefaults {
                enabled: true,
                min_quality_score: 0.5,
            },
            features: FeatureFlags {
                features_enabled: false,
                domainless_ranking: false,
                mmr_enabled: false,
                query_adaptive_weights: false,
                kw_points_enabled: false,
                fusion_debug_trace: false,
                deduplication: true,
            },
            timeouts: StageTimeouts {
                vector_ms: 5000,
                keyword_ms: 3000,
                reranker_ms: 10_000,
                embedding_ms: 5000,
                overall_ms: 45_000,
            },
            query_cache: QueryCacheConfig {
                enabled: false,
                capacity: 256,
                ttl_secs: 60,
            },
            alias: AliasConfig {
                emb_sim_tau: 0.78,
                pmi_sim_tau: 2.0,
                cache_ttl_secs: 3600,
                cache_capacity: 512,
            },
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes")
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl RetrievalConfig {
    /// Apply the authoritative env-var table on top of the current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("FEATURES_ENABLED") {
            self.features.features_enabled = v;
        }
        if let Some(v) = env_bool("DOMAINLESS_RANKING_ENABLED") {
            self.features.domainless_ranking = v;
        }
        if let Some(v) = env_bool("MMR_ENABLED") {
            self.features.mmr_enabled = v;
        }
        if let Some(v) = env_bool("QUERY_ADAPTIVE_WEIGHTS") {
            self.features.query_adaptive_weights = v;
        }
        if let Some(v) = env_bool("KW_POINTS_ENABLED") {
            self.features.kw_points_enabled = v;
        }
        if let Some(v) = env_bool("FUSION_DEBUG_TRACE") {
            self.features.fusion_debug_trace = v;
        }
        if let Some(v) = env_bool("DEDUPLICATION_ENABLED") {
            self.features.deduplication = v;
        }
        if let Some(v) = env_parse::<f32>("MIN_QUALITY_SCORE") {
            self.guardrail.min_quality_score = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_CONTEXT_TOKENS") {
            self.packing.max_context_tokens = v;
        }
        if let Some(v) = env_parse::<usize>("RETRIEVAL_K_BASE") {
            self.search.retrieval_k = v;
        }
        if let Ok(v) = std::env::var("RERANKER_ENDPOINT") {
            self.reranker.endpoint = v;
        }
        if let Some(v) = env_bool("RERANKER_ENABLED") {
            self.reranker.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("RERANKER_BATCH_SIZE") {
            self.reranker.batch_size = v;
        }
        if let Some(v) = env_parse::<u64>("RERANKER_TIMEOUT_MS") {
            self.reranker.timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("RERANKER_TOPN_IN") {
            self.reranker.top_n_in = v;
        }
        if let Some(v) = env_parse::<usize>("RERANKER_TOPN_OUT") {
            self.reranker.top_n_out = v;
        }
        if let Some(v) = env_parse::<f32>("ALIAS_EMB_SIM_TAU") {
            self.alias.emb_sim_tau = v;
        }
        if let Some(v) = env_parse::<f64>("ALIAS_PMI_SIM_TAU") {
            self.alias.pmi_sim_tau = v;
        }
    }

    /// Validate config values, rejecting clearly broken configurations.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let fail = |msg: &str| Err(RetrievalError::InvalidConfiguration(msg.to_string()));

        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be > 0");
        }
        if !(0.0..1.0).contains(&self.embedding.safety_margin) {
            return fail("embedding.safety_margin must be in [0, 1)");
        }
        if self.chunking.max_tokens == 0 {
            return fail("chunking.max_tokens must be > 0");
        }
        if self.chunking.chars_per_token <= 0.0 {
            return fail("chunking.chars_per_token must be > 0");
        }
        if self.search.retrieval_k < 1 {
            return fail("search.retrieval_k must be >= 1");
        }
        if self.search.vector_weight < 0.0 || self.search.keyword_weight < 0.0 {
            return fail("search weights must be non-negative");
        }
        if self.packing.max_context_tokens < 1000 {
            return fail("packing.max_context_tokens must be >= 1000");
        }
        if !(0.0..=1.0).contains(&self.guardrail.min_quality_score) {
            return fail("guardrail.min_quality_score must be in [0, 1]");
        }
        if self.reranker.batch_size == 0 {
            return fail("reranker.batch_size must be > 0");
        }
        if !(0.0..=1.0).contains(&self.sections.min_trigger_score) {
            return fail("sections.min_trigger_score must be in [0, 1]");
        }
        Ok(())
    }

    /// Load config from a JSON file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, RetrievalError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::InvalidConfiguration(format!("failed to read config file: {e}"))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            RetrievalError::InvalidConfiguration(format!("failed to parse config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Per-tenant search config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSearchConfig {
    pub tenant_id: String,
    pub keyword_search_enabled: bool,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: u32,
    pub reranker_enabled: bool,
    pub reranker_model: String,
    pub reranker_top_k: usize,
    pub reranker_score_threshold: f32,
    pub timeouts: StageTimeouts,
}

impl TenantSearchConfig {
    /// Global defaults applied for unknown tenants.
    pub fn defaults_for(tenant_id: &str, global: &RetrievalConfig) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            keyword_search_enabled: global.search.keyword_search_enabled,
            vector_weight: global.search.vector_weight,
            keyword_weight: global.search.keyword_weight,
            rrf_k: global.search.rrf_k,
            reranker_enabled: global.reranker.enabled,
            reranker_model: global.reranker.model.clone(),
            reranker_top_k: global.reranker.top_n_out,
            reranker_score_threshold: global.reranker.score_threshold,
            timeouts: global.timeouts.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.tenant_id.is_empty() {
            return Err(RetrievalError::InvalidConfiguration(
                "tenant_id must be non-empty".into(),
            ));
        }
        if self.vector_weight < 0.0 || self.keyword_weight < 0.0 {
            return Err(RetrievalError::InvalidConfiguration(
                "tenant weights must be non-negative".into(),
            ));
        }
        if self.reranker_top_k == 0 {
            return Err(RetrievalError::InvalidConfiguration(
                "reranker_top_k must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-tenant guardrail config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerabilityThreshold {
    pub min_confidence: f32,
    pub min_top_score: f32,
    pub min_mean_score: f32,
    pub max_std_dev: f32,
    pub min_result_count: usize,
}

impl AnswerabilityThreshold {
    pub fn strict() -> Self {
        Self {
            min_confidence: 0.8,
            min_top_score: 0.7,
            min_mean_score: 0.5,
            max_std_dev: 0.3,
            min_result_count: 2,
        }
    }

    pub fn moderate() -> Self {
        Self {
            min_confidence: 0.6,
            min_top_score: 0.5,
            min_mean_score: 0.35,
            max_std_dev: 0.45,
            min_result_count: 1,
        }
    }

    pub fn permissive() -> Self {
        Self {
            min_confidence: 0.4,
            min_top_score: 0.3,
            min_mean_score: 0.2,
            max_std_dev: 0.6,
            min_result_count: 1,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(Self::strict()),
            "moderate" => Some(Self::moderate()),
            "permissive" => Some(Self::permissive()),
            _ => None,
        }
    }
}

/// Weights for the four answerability sub-scores. Validated to sum to at
/// most 1.2 so tenants can over-weight one signal without runaway scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmWeights {
    pub statistical: f32,
    pub threshold: f32,
    pub ml_features: f32,
    pub reranker_confidence: f32,
}

impl Default for AlgorithmWeights {
    fn default() -> Self {
        Self {
            statistical: 0.4,
            threshold: 0.3,
            ml_features: 0.2,
            reranker_confidence: 0.1,
        }
    }
}

impl AlgorithmWeights {
    pub fn sum(&self) -> f32 {
        self.statistical + self.threshold + self.ml_features + self.reranker_confidence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdkTemplate {
    pub id: String,
    pub reason_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    pub suggestions_enabled: bool,
    pub max_suggestions: usize,
    /// Minimum candidate score for a rejected result to become a suggestion.
    pub suggestion_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantGuardrailConfig {
    pub tenant_id: String,
    pub enabled: bool,
    pub bypass_enabled: bool,
    #[serde(default)]
    pub bypass_groups: Vec<String>,
    pub threshold: AnswerabilityThreshold,
    pub weights: AlgorithmWeights,
    #[serde(default)]
    pub idk_templates: Vec<IdkTemplate>,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

impl TenantGuardrailConfig {
    pub fn defaults_for(tenant_id: &str, global: &RetrievalConfig) -> Self {
        let mut threshold = AnswerabilityThreshold::moderate();
        threshold.min_confidence = global.guardrail.min_quality_score;
        Self {
            tenant_id: tenant_id.to_string(),
            enabled: global.guardrail.enabled,
            bypass_enabled: false,
            bypass_groups: vec!["admin".to_string()],
            threshold,
            weights: AlgorithmWeights::default(),
            idk_templates: Vec::new(),
            fallback: None,
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        let fail = |msg: String| Err(RetrievalError::InvalidConfiguration(msg));

        let t = &self.threshold;
        for (name, v) in [
            ("minConfidence", t.min_confidence),
            ("minTopScore", t.min_top_score),
            ("minMeanScore", t.min_mean_score),
            ("maxStdDev", t.max_std_dev),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return fail(format!("threshold.{name} must be in [0, 1], got {v}"));
            }
        }
        if self.weights.sum() > 1.2 {
            return fail(format!(
                "algorithm weights must sum to <= 1.2, got {}",
                self.weights.sum()
            ));
        }
        for template in &self.idk_templates {
            if template.id.is_empty() {
                return fail("idk template id must be non-empty".into());
            }
        }
        if let Some(fallback) = &self.fallback {
            if fallback.max_suggestions > 10 {
                return fail(format!(
                    "fallback.maxSuggestions must be <= 10, got {}",
                    fallback.max_suggestions
                ));
            }
            if !(0.0..=1.0).contains(&fallback.suggestion_threshold) {
                return fail("fallback.suggestionThreshold must be in [0, 1]".into());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Read-mostly per-tenant config map. Writes validate first; a rejected
/// update leaves the previous config in place, so query-time reads never
/// observe an invalid config.
pub struct TenantConfigRegistry {
    global: RetrievalConfig,
    search: dashmap::DashMap<String, Arc<TenantSearchConfig>>,
    guardrail: dashmap::DashMap<String, Arc<TenantGuardrailConfig>>,
}

impl TenantConfigRegistry {
    pub fn new(global: RetrievalConfig) -> Self {
        Self {
            global,
            search: dashmap::DashMap::new(),
            guardrail: dashmap::DashMap::new(),
        }
    }

    pub fn global(&self) -> &RetrievalConfig {
        &self.global
    }

    pub fn upsert_search(&self, config: TenantSearchConfig) -> Result<(), RetrievalError> {
        config.validate()?;
        self.search
            .insert(config.tenant_id.clone(), Arc::new(config));
        Ok(())
    }

    pub fn upsert_guardrail(&self, config: TenantGuardrailConfig) -> Result<(), RetrievalError> {
        config.validate()?;
        self.guardrail
            .insert(config.tenant_id.clone(), Arc::new(config));
        Ok(())
    }

    pub fn search_config(&self, tenant_id: &str) -> Arc<TenantSearchConfig> {
        self.search
            .get(tenant_id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| {
                Arc::new(TenantSearchConfig::defaults_for(tenant_id, &self.global))
            })
    }

    pub fn guardrail_config(&self, tenant_id: &str) -> Arc<TenantGuardrailConfig> {
        self.guardrail
            .get(tenant_id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| {
                Arc::new(TenantGuardrailConfig::defaults_for(tenant_id, &self.global))
            })
    }
}
