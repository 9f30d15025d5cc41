use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::{l2_normalize, Embedder};
use crate::chunking::{AdaptiveChunker, ChunkStrategy, TokenCounter};
use crate::config::EmbeddingConfig;
use crate::error::RetrievalError;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_BASE_MS: u64 = 100;

/// HTTP embedding client. The endpoint accepts `{"inputs": [text, ...]}`
/// and returns `[[f32, ...], ...]` of the configured dimension.
///
/// Text above the model's token maximum is chunked, embedded per chunk,
/// averaged elementwise and renormalized.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    dimension: usize,
    counter: TokenCounter,
    chunker: AdaptiveChunker,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RetrievalError::EmbeddingUnavailable(e.to_string()))?;

        let counter = TokenCounter::bge(config.max_tokens, config.safety_margin);
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            dimension: config.dimension,
            counter,
            chunker: AdaptiveChunker::new(counter, ChunkStrategy::TokenAware, 0),
        })
    }

    fn health_endpoint(&self) -> String {
        match self.endpoint.rfind('/') {
            Some(pos) if pos > "https://".len() => format!("{}/health", &self.endpoint[..pos]),
            _ => format!("{}/health", self.endpoint.trim_end_matches('/')),
        }
    }

    /// One POST to the embed endpoint with retry on transport errors and
    /// 429. 413 means the payload will never fit and is not retried.
    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let body = serde_json::json!({ "inputs": inputs });
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS << (attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let response = match self.client.post(&self.endpoint).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                return Err(RetrievalError::EmbeddingUnavailable(
                    "embedding payload too large (413)".into(),
                ));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                last_error = "rate limited (429)".into();
                continue;
            }
            if !status.is_success() {
                return Err(RetrievalError::EmbeddingUnavailable(format!(
                    "embedding endpoint returned HTTP {status}"
                )));
            }

            let vectors: Vec<Vec<f32>> = response
                .json()
                .await
                .map_err(|e| RetrievalError::EmbeddingUnavailable(format!("malformed body: {e}")))?;
            return Ok(vectors);
        }

        tracing::error!(
            endpoint = %self.endpoint,
            attempts = MAX_ATTEMPTS,
            error = %last_error,
            "embedding request failed after retries"
        );
        Err(RetrievalError::EmbeddingUnavailable(last_error))
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<(), RetrievalError> {
        for vector in vectors {
            if vector.len() != self.dimension {
                return Err(RetrievalError::InvalidDimension {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }
        Ok(())
    }

    /// Request with a single follow-up retry if the first response comes
    /// back with the wrong dimension.
    async fn request_checked(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let vectors = self.request_embeddings(inputs).await?;
        match self.check_dimensions(&vectors) {
            Ok(()) => Ok(vectors),
            Err(first_mismatch) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    "embedding dimension mismatch, retrying once"
                );
                let vectors = self.request_embeddings(inputs).await?;
                self.check_dimensions(&vectors).map_err(|_| first_mismatch)?;
                Ok(vectors)
            }
        }
    }

    /// Chunk an overlong text, embed the chunks, average elementwise and
    /// renormalize.
    async fn embed_long(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let output = self.chunker.chunk(text, "embed");
        let inputs: Vec<String> = output.chunks.into_iter().map(|c| c.text).collect();
        if inputs.is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }
        let vectors = self.request_checked(&inputs).await?;

        let mut averaged = vec![0.0f32; self.dimension];
        for vector in &vectors {
            for (slot, v) in averaged.iter_mut().zip(vector) {
                *slot += v;
            }
        }
        let n = vectors.len() as f32;
        for slot in averaged.iter_mut() {
            *slot /= n;
        }
        l2_normalize(&mut averaged);
        Ok(averaged)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        if self.counter.count(text) > self.counter.max_tokens() {
            return self.embed_long(text).await;
        }
        let vectors = self.request_checked(&[text.to_string()]).await?;
        vectors.into_iter().next().ok_or_else(|| {
            RetrievalError::EmbeddingUnavailable("endpoint returned no vectors".into())
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut short_inputs = Vec::new();
        let mut short_slots = Vec::new();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        for (i, text) in texts.iter().enumerate() {
            if self.counter.count(text) > self.counter.max_tokens() {
                results[i] = Some(self.embed_long(text).await?);
            } else {
                short_inputs.push(text.clone());
                short_slots.push(i);
            }
        }

        if !short_inputs.is_empty() {
            let vectors = self.request_checked(&short_inputs).await?;
            if vectors.len() != short_inputs.len() {
                return Err(RetrievalError::EmbeddingUnavailable(format!(
                    "expected {} vectors, got {}",
                    short_inputs.len(),
                    vectors.len()
                )));
            }
            for (slot, vector) in short_slots.into_iter().zip(vectors) {
                results[slot] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health_check(&self) -> bool {
        let url = self.health_endpoint();
        match self.client.get(&url).timeout(Duration::from_secs(3)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder() -> HttpEmbedder {
        HttpEmbedder::new(&EmbeddingConfig {
            endpoint: "http://localhost:9090/embed".into(),
            dimension: 4,
            max_tokens: 512,
            safety_margin: 0.1,
            cache_size: 16,
        })
        .unwrap()
    }

    #[test]
    fn health_endpoint_is_a_sibling_of_embed() {
        assert_eq!(embedder().health_endpoint(), "http://localhost:9090/health");
    }

    #[test]
    fn dimension_check_reports_expected_and_actual() {
        let e = embedder();
        let err = e.check_dimensions(&[vec![0.0; 3]]).unwrap_err();
        match err {
            RetrievalError::InvalidDimension { expected, actual } => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dimension_check_accepts_exact_vectors() {
        assert!(embedder().check_dimensions(&[vec![0.0; 4], vec![1.0; 4]]).is_ok());
    }
}
