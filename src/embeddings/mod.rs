pub mod http;

use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::RetrievalError;

pub use http::HttpEmbedder;

/// Batched text → fixed-dimension L2-normalized vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    fn dimension(&self) -> usize;

    /// True when the backing service answers its health endpoint.
    async fn health_check(&self) -> bool;
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

/// Bounded memoization of embeddings keyed on text. Query embedding is on
/// the hot path of every search; repeated queries skip the round trip.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        if let Some(hit) = self.cache.lock().get(text) {
            return Ok(hit.clone());
        }
        let vector = self.inner.embed(text).await?;
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(text) {
                    Some(hit) => results.push(Some(hit.clone())),
                    None => {
                        results.push(None);
                        misses.push(i);
                    }
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed_batch(&miss_texts).await?;
            let mut cache = self.cache.lock();
            for (&i, vector) in misses.iter().zip(vectors) {
                cache.put(texts[i].clone(), vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![text.len() as f32, 1.0, 0.5];
            l2_normalize(&mut v);
            Ok(v)
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
            true
        }
    }

    #[tokio::test]
    async fn cached_embedder_skips_repeat_calls() {
        let embedder = CachedEmbedder::new(CountingEmbedder { calls: AtomicUsize::new(0) }, 16);
        let first = embedder.embed("same query").await.unwrap();
        let second = embedder.embed("same query").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(embedder.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_reuses_cached_entries() {
        let embedder = CachedEmbedder::new(CountingEmbedder { calls: AtomicUsize::new(0) }, 16);
        embedder.embed("alpha").await.unwrap();
        let batch = embedder
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        // One call for "alpha", one for "beta" in the miss batch.
        assert_eq!(embedder.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        assert!((norm - 1.0).abs() <= 1e-5);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.2, 0.4, 0.6];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&v, &[]), 0.0);
    }
}
