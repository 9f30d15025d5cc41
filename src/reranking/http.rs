use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{RerankCandidate, Reranker};
use crate::config::RerankerConfig;

/// Query text cap, roughly 300 tokens.
const MAX_QUERY_CHARS: usize = 1200;
/// Candidate text cap, roughly 512 tokens.
const MAX_CANDIDATE_CHARS: usize = 2048;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<String>,
}

/// HTTP cross-encoder client. Batches are issued sequentially with a short
/// per-request timeout; the caller treats any error as a pass-through.
pub struct HttpReranker {
    client: Client,
    endpoint: String,
    batch_size: usize,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("building reranker http client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            batch_size: config.batch_size.max(1),
        })
    }

    fn base_url(&self) -> String {
        match self.endpoint.rfind('/') {
            Some(pos) if pos > "https://".len() => self.endpoint[..pos].to_string(),
            _ => self.endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn score_batch(&self, query: &str, batch: &[RerankCandidate]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "query": truncate_chars(query, MAX_QUERY_CHARS),
            "candidates": batch
                .iter()
                .map(|c| serde_json::json!({
                    "id": c.id,
                    "text": truncate_chars(&c.text, MAX_CANDIDATE_CHARS),
                }))
                .collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("reranker request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("reranker returned HTTP {status}"));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .context("reranker returned a malformed body")?;
        if parsed.scores.len() != batch.len() {
            return Err(anyhow!(
                "reranker returned {} scores for {} candidates",
                parsed.scores.len(),
                batch.len()
            ));
        }
        Ok(parsed.scores)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, candidates: &[RerankCandidate]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(self.batch_size) {
            scores.extend(self.score_batch(query, batch).await?);
        }
        Ok(scores)
    }

    /// Healthy when either the health endpoint answers or a one-document
    /// probe scores within the window.
    async fn is_healthy(&self) -> bool {
        let health_url = format!("{}/health", self.base_url());
        if let Ok(response) = self
            .client
            .get(&health_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            if response.status().is_success() {
                return true;
            }
        }

        let probe = [RerankCandidate {
            id: "probe".to_string(),
            text: "probe document".to_string(),
        }];
        tokio::time::timeout(HEALTH_TIMEOUT, self.score_batch("probe", &probe))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn models(&self) -> Result<Vec<String>> {
        let url = format!("{}/rerank/models", self.base_url());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("reranker models request failed")?;
        let parsed: ModelsResponse = response
            .json()
            .await
            .context("reranker models response malformed")?;
        Ok(parsed.models)
    }
}

/// Prefix truncation on a char boundary.
fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
