//! Hybrid search orchestrator. Drives the full pipeline: caller
//! validation, tenant config resolution, query embedding, parallel
//! vector + keyword retrieval with per-stage deadlines, fusion, optional
//! domainless re-scoring, dedup, reranking, section enrichment, context
//! packing and the answerability guardrail.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::chunking::TokenCounter;
use crate::config::{RetrievalConfig, TenantConfigRegistry, TenantSearchConfig};
use crate::embeddings::Embedder;
use crate::error::RetrievalError;
use crate::guardrail::{
    AuditLog, AuditRecord, Guardrail, GuardrailDecision, IdkResponse, LatencyBreakdown,
};
use crate::packing::ContextPacker;
use crate::reranking::{apply_reranking, RerankOutcome, RerankParams, Reranker};
use crate::search::{
    adaptive_weights, fuse, FusionParams, FusionStrategy, FusionTrace, KeywordSearchOptions,
    KeywordSearcher, Normalization,
};
use crate::sections::SectionEnricher;
use crate::stats::{
    coverage_features, exclusivity_penalty, extract_keyphrases, keyword_points_score,
    present_mask, AliasClusterer, CorpusStatsStore,
};
use crate::store::{FieldCondition, Filter, VectorStore};
use crate::text::tokenize;
use crate::types::{SearchMetrics, SearchRequest, SearchResult, SearchType, UserContext};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Empty when the guardrail blocks; see `idk_response`.
    pub final_results: Vec<SearchResult>,
    pub metrics: SearchMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_results: Option<Vec<SearchResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion_trace: Option<FusionTrace>,
    pub guardrail: GuardrailDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idk_response: Option<IdkResponse>,
}

/// Millisecond rounding that never reports a spent stage as zero.
fn duration_ms(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    if ms == 0 && d.as_nanos() > 0 {
        1
    } else {
        ms
    }
}

pub struct RetrievalEngine {
    registry: TenantConfigRegistry,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    keyword: KeywordSearcher,
    sections: SectionEnricher,
    packer: ContextPacker,
    guardrail: Guardrail,
    stats: Arc<CorpusStatsStore>,
    alias: AliasClusterer,
    audit: AuditLog,
    query_cache: Option<Mutex<LruCache<String, (SearchResponse, Instant)>>>,
}

impl RetrievalEngine {
    pub fn new(
        config: RetrievalConfig,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Result<Self, RetrievalError> {
        config.validate()?;

        let counter = TokenCounter::with_ratio(
            config.chunking.chars_per_token,
            config.embedding.max_tokens,
            config.embedding.safety_margin,
        );
        let stats = Arc::new(CorpusStatsStore::new(config.data_dir.clone()));
        let audit = AuditLog::new(config.data_dir.clone());
        let keyword = KeywordSearcher::new(Arc::clone(&store));
        let sections = SectionEnricher::new(Arc::clone(&store), config.sections.clone());
        let packer = ContextPacker::new(config.packing.clone(), counter);
        let alias = AliasClusterer::new(Arc::clone(&embedder), config.alias.clone());
        let query_cache = if config.query_cache.enabled {
            let capacity = NonZeroUsize::new(config.query_cache.capacity.max(1))
                .unwrap_or(NonZeroUsize::MIN);
            Some(Mutex::new(LruCache::new(capacity)))
        } else {
            None
        };

        Ok(Self {
            registry: TenantConfigRegistry::new(config),
            store,
            embedder,
            reranker,
            keyword,
            sections,
            packer,
            guardrail: Guardrail::new(),
            stats,
            alias,
            audit,
            query_cache,
        })
    }

    /// Per-tenant config registry for runtime upserts. Invalid configs are
    /// rejected at the write; queries only ever see validated state.
    pub fn tenant_configs(&self) -> &TenantConfigRegistry {
        &self.registry
    }

    pub fn stats_store(&self) -> &Arc<CorpusStatsStore> {
        &self.stats
    }

    pub async fn search(
        &self,
        collection: &str,
        request: SearchRequest,
        user: &UserContext,
    ) -> Result<SearchResponse, RetrievalError> {
        let started = Instant::now();

        if user.id.trim().is_empty() || user.tenant_id.trim().is_empty() {
            self.audit
                .record(AuditRecord::for_error(&request.query, user, "unauthorized caller"));
            return Err(RetrievalError::Unauthorized);
        }
        if let Some(requested) = &request.tenant_id {
            if requested != &user.tenant_id {
                self.audit.record(AuditRecord::for_error(
                    &request.query,
                    user,
                    "request tenant does not match caller tenant",
                ));
                return Err(RetrievalError::Unauthorized);
            }
        }

        let tenant = self.registry.search_config(&user.tenant_id);

        let cache_key = self.cache_key(collection, &request, &tenant, user);
        if let Some(cache) = &self.query_cache {
            let ttl = Duration::from_secs(self.registry.global().query_cache.ttl_secs);
            let mut cache = cache.lock();
            if let Some((response, at)) = cache.get(&cache_key) {
                if at.elapsed() < ttl {
                    tracing::debug!(tenant = %user.tenant_id, "query cache hit");
                    return Ok(response.clone());
                }
            }
        }

        let overall = Duration::from_millis(tenant.timeouts.overall_ms);
        let outcome = tokio::time::timeout(
            overall,
            self.run_pipeline(collection, &request, user, &tenant, started),
        )
        .await;

        match outcome {
            Ok(Ok(response)) => {
                if let Some(cache) = &self.query_cache {
                    cache
                        .lock()
                        .put(cache_key, (response.clone(), Instant::now()));
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                self.audit
                    .record(AuditRecord::for_error(&request.query, user, e.code()));
                Err(e)
            }
            Err(_) => {
                self.audit
                    .record(AuditRecord::for_error(&request.query, user, "overall-timeout"));
                Err(RetrievalError::OverallTimeout)
            }
        }
    }

    async fn run_pipeline(
        &self,
        collection: &str,
        request: &SearchRequest,
        user: &UserContext,
        tenant: &TenantSearchConfig,
        started: Instant,
    ) -> Result<SearchResponse, RetrievalError> {
        let global = self.registry.global();
        let flags = &global.features;
        let domainless = flags.features_enabled && flags.domainless_ranking;
        let kw_points = flags.features_enabled && flags.kw_points_enabled;
        let adaptive = flags.features_enabled && flags.query_adaptive_weights;

        // Query embedding is the one stage whose timeout is fatal.
        let embed_deadline = Duration::from_millis(tenant.timeouts.embedding_ms);
        let query_vector =
            match tokio::time::timeout(embed_deadline, self.embedder.embed(&request.query)).await {
                Ok(Ok(vector)) => vector,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(RetrievalError::EmbeddingTimeout),
            };

        let stats = self.stats.get(&user.tenant_id);

        let mut vector_weight = request.vector_weight.unwrap_or(tenant.vector_weight);
        let mut keyword_weight = request.keyword_weight.unwrap_or(tenant.keyword_weight);
        if adaptive {
            let content_tokens = tokenize(&request.query);
            let rare = content_tokens
                .iter()
                .filter(|t| stats.idf_of(t) >= global.search.high_value_idf)
                .count();
            let (wv, wk) = adaptive_weights(
                content_tokens.len(),
                rare,
                (vector_weight, keyword_weight),
            );
            vector_weight = wv;
            keyword_weight = wk;
        }

        let fetch_limit = request.limit.max(global.search.retrieval_k);
        let keyword_enabled = request
            .enable_keyword_search
            .unwrap_or(tenant.keyword_search_enabled);

        let mut vector_filter = Filter::rbac(user);
        if let Some(space_ids) = &request.space_ids {
            if !space_ids.is_empty() {
                vector_filter =
                    vector_filter.with_must(FieldCondition::any("spaceId", space_ids.clone()));
            }
        }

        // Vector and keyword channels run concurrently, each under its own
        // deadline; a failed or slow channel degrades to empty.
        let vector_deadline = Duration::from_millis(tenant.timeouts.vector_ms);
        let keyword_deadline = Duration::from_millis(tenant.timeouts.keyword_ms);

        let vector_future = async {
            let channel_started = Instant::now();
            let points = match tokio::time::timeout(
                vector_deadline,
                self.store
                    .search(collection, &query_vector, fetch_limit, &vector_filter),
            )
            .await
            {
                Ok(Ok(points)) => points,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "vector channel failed");
                    Vec::new()
                }
                Err(_) => {
                    tracing::warn!(timeout_ms = tenant.timeouts.vector_ms, "vector channel timed out");
                    Vec::new()
                }
            };
            (points, channel_started.elapsed())
        };

        let keyword_future = async {
            let channel_started = Instant::now();
            let results = if keyword_enabled {
                let options = KeywordSearchOptions {
                    limit: fetch_limit,
                    space_ids: request.space_ids.clone(),
                    domainless,
                    high_value_idf: global.search.high_value_idf,
                };
                match tokio::time::timeout(
                    keyword_deadline,
                    self.keyword
                        .search(collection, &request.query, user, &stats, &options),
                )
                .await
                {
                    Ok(Ok(results)) => results,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "keyword channel failed");
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!(timeout_ms = tenant.timeouts.keyword_ms, "keyword channel timed out");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            (results, channel_started.elapsed())
        };

        let ((points, vector_duration), (keyword_results, keyword_duration)) =
            tokio::join!(vector_future, keyword_future);

        let mut chunk_vectors: HashMap<String, Vec<f32>> = HashMap::new();
        let vector_results: Vec<SearchResult> = points
            .into_iter()
            .map(|point| {
                if let Some(vector) = &point.vector {
                    chunk_vectors.insert(point.id.clone(), vector.clone());
                }
                let mut result = SearchResult::new(point.id, point.score, SearchType::VectorOnly);
                result.vector_score = Some(point.score);
                result.content = point
                    .payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                result.payload = point.payload;
                result
            })
            .collect();

        let fusion_started = Instant::now();
        let params = FusionParams {
            strategy: FusionStrategy::parse(&global.search.fusion_strategy),
            normalization: Normalization::parse(&global.search.normalization),
            vector_weight,
            keyword_weight,
            rrf_k: request.rrf_k.unwrap_or(tenant.rrf_k),
        };
        let (mut fused, trace) = fuse(&vector_results, &keyword_results, &params);

        if domainless && !fused.is_empty() {
            let phrases = extract_keyphrases(
                &request.query,
                &stats,
                global.search.high_value_idf,
                global.alias.pmi_sim_tau,
            );
            let mut groups: Vec<Vec<String>> = Vec::new();
            for token in phrases.tokens.iter().take(4) {
                let cluster = self.alias.cluster(&user.tenant_id, token, &stats).await;
                groups.push(cluster.members);
            }
            if !groups.is_empty() {
                for result in fused.iter_mut() {
                    let features = coverage_features(result, &groups);
                    let present = present_mask(result, &groups);
                    let penalty = exclusivity_penalty(
                        &groups,
                        &present,
                        &stats,
                        global.search.high_value_idf,
                    );
                    let rescored = if kw_points {
                        keyword_points_score(result.score, &features, penalty)
                    } else {
                        (result.score - 0.2 * penalty).max(0.0)
                    };
                    result.score = rescored;
                    result.fusion_score = Some(rescored);
                }
                fused.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }

        if flags.deduplication {
            fused = dedup_by_doc(fused);
        }
        let fusion_duration = fusion_started.elapsed();

        let rerank_started = Instant::now();
        let outcome = match (&self.reranker, tenant.reranker_enabled) {
            (Some(reranker), true) => {
                let rerank_params = RerankParams {
                    top_n_in: global.reranker.top_n_in,
                    top_k: tenant.reranker_top_k,
                    score_threshold: tenant.reranker_score_threshold,
                    timeout: Duration::from_millis(tenant.timeouts.reranker_ms),
                };
                apply_reranking(reranker.as_ref(), &request.query, fused, &rerank_params).await
            }
            _ => RerankOutcome {
                results: fused,
                reranking_enabled: false,
                documents_reranked: 0,
            },
        };
        let reranker_duration = rerank_started.elapsed();
        let reranking_enabled = outcome.reranking_enabled;
        let documents_reranked = outcome.documents_reranked;
        let mut results = outcome.results;
        let reranker_results = reranking_enabled.then(|| results.clone());

        if global.sections.enabled {
            results = self.sections.enrich(collection, results, user).await;
        }

        if flags.mmr_enabled {
            results = self.packer.mmr_order(results, Some(&chunk_vectors));
        }

        let vectors_opt = (!chunk_vectors.is_empty()).then_some(&chunk_vectors);
        let packed = self.packer.pack(&request.query, results, vectors_opt);
        let mut final_results: Vec<SearchResult> =
            packed.chunks.into_iter().take(request.limit).collect();
        let packed_count = final_results.len();

        let guardrail_started = Instant::now();
        let guard_config = self.registry.guardrail_config(&user.tenant_id);
        let decision = self.guardrail.evaluate(
            &request.query,
            &final_results,
            user,
            &guard_config,
            reranking_enabled,
        );
        let guardrail_duration = guardrail_started.elapsed();

        let idk_response = decision.idk_response.clone();
        if !decision.is_answerable {
            final_results.clear();
        }

        let total_duration = started.elapsed();
        let metrics = SearchMetrics {
            vector_search_duration_ms: duration_ms(vector_duration),
            keyword_search_duration_ms: duration_ms(keyword_duration),
            fusion_duration_ms: duration_ms(fusion_duration),
            reranker_duration_ms: duration_ms(reranker_duration),
            guardrail_duration_ms: Some(duration_ms(guardrail_duration)),
            total_duration_ms: duration_ms(total_duration),
            vector_result_count: vector_results.len(),
            keyword_result_count: keyword_results.len(),
            final_result_count: final_results.len(),
            reranking_enabled,
            documents_reranked,
        };

        self.audit.record(AuditRecord::for_decision(
            &decision,
            &request.query,
            user,
            packed_count,
            LatencyBreakdown {
                retrieval_ms: duration_ms(total_duration.saturating_sub(guardrail_duration)),
                guardrail_ms: duration_ms(guardrail_duration),
                total_ms: duration_ms(total_duration),
            },
        ));

        Ok(SearchResponse {
            final_results,
            metrics,
            reranker_results,
            fusion_trace: flags.fusion_debug_trace.then_some(trace),
            guardrail: decision,
            idk_response,
        })
    }

    fn cache_key(
        &self,
        collection: &str,
        request: &SearchRequest,
        tenant: &TenantSearchConfig,
        user: &UserContext,
    ) -> String {
        let mut acls = user.acl_principals();
        acls.sort();
        format!(
            "{collection}|{}|{}|{:.4}|{:.4}|{}|{}|{}",
            request.query,
            request.limit,
            request.vector_weight.unwrap_or(tenant.vector_weight),
            request.keyword_weight.unwrap_or(tenant.keyword_weight),
            request.rrf_k.unwrap_or(tenant.rrf_k),
            user.tenant_id,
            acls.join(",")
        )
    }
}

/// At most one chunk per document, keeping the higher-scored one. Chunks
/// without a document id dedup by their own id. Section fragments keep
/// their part identity here so the section detector still sees them; the
/// reconstruction stage reunifies them into one item per document section.
fn dedup_by_doc(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut seen: HashSet<String> = HashSet::new();
    results
        .into_iter()
        .filter(|r| {
            let doc = r.doc_id().unwrap_or(&r.id);
            let key = match r.section_path() {
                Some(path) => format!("{doc}#{path}"),
                None => doc.to_string(),
            };
            seen.insert(key)
        })
        .collect()
}
