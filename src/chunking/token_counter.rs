use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// What the counter reports for a piece of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimate {
    pub characters: usize,
    pub tokens: usize,
    /// `tokens <= max_tokens * (1 - safety_margin)`.
    pub within_safe_limit: bool,
}

/// Character-ratio token estimator. Two calibrated flavors plus a custom
/// ratio; all share the same safe-limit rule.
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    chars_per_token: f32,
    max_tokens: usize,
    safety_margin: f32,
}

impl TokenCounter {
    /// BGE-family models average ~3.2 characters per token.
    pub fn bge(max_tokens: usize, safety_margin: f32) -> Self {
        Self::with_ratio(3.2, max_tokens, safety_margin)
    }

    /// OpenAI-family tokenizers average ~4 characters per token.
    pub fn openai(max_tokens: usize, safety_margin: f32) -> Self {
        Self::with_ratio(4.0, max_tokens, safety_margin)
    }

    pub fn with_ratio(chars_per_token: f32, max_tokens: usize, safety_margin: f32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(0.1),
            max_tokens,
            safety_margin: safety_margin.clamp(0.0, 0.99),
        }
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f32 / self.chars_per_token).ceil() as usize
    }

    pub fn estimate(&self, text: &str) -> TokenEstimate {
        let characters = text.chars().count();
        let tokens = self.count(text);
        TokenEstimate {
            characters,
            tokens,
            within_safe_limit: tokens <= self.safe_limit(),
        }
    }

    /// Token budget after the safety margin is shaved off the model max.
    pub fn safe_limit(&self) -> usize {
        ((self.max_tokens as f32) * (1.0 - self.safety_margin)).floor() as usize
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn chars_per_token(&self) -> f32 {
        self.chars_per_token
    }

    /// Character window corresponding to the safe token budget.
    pub fn safe_character_window(&self) -> usize {
        ((self.safe_limit() as f32) * self.chars_per_token).floor() as usize
    }
}

/// Thread-safe memoizing wrapper keyed on text identity. Estimation is
/// cheap but the chunker re-counts the same sentences many times while
/// packing them into budgets.
pub struct CachingTokenCounter {
    inner: TokenCounter,
    cache: Mutex<LruCache<String, TokenEstimate>>,
}

impl CachingTokenCounter {
    pub fn new(inner: TokenCounter, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn estimate(&self, text: &str) -> TokenEstimate {
        if let Some(hit) = self.cache.lock().get(text) {
            return *hit;
        }
        let estimate = self.inner.estimate(text);
        self.cache.lock().put(text.to_string(), estimate);
        estimate
    }

    pub fn count(&self, text: &str) -> usize {
        self.estimate(text).tokens
    }

    pub fn inner(&self) -> &TokenCounter {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bge_ratio_is_denser_than_openai() {
        let text = "retrieval augmented generation pipelines".repeat(4);
        let bge = TokenCounter::bge(512, 0.1);
        let openai = TokenCounter::openai(512, 0.1);
        assert!(bge.count(&text) > openai.count(&text));
    }

    #[test]
    fn empty_text_counts_zero_tokens() {
        let counter = TokenCounter::bge(512, 0.1);
        let estimate = counter.estimate("");
        assert_eq!(estimate.tokens, 0);
        assert_eq!(estimate.characters, 0);
        assert!(estimate.within_safe_limit);
    }

    #[test]
    fn safe_limit_shaves_the_margin() {
        let counter = TokenCounter::bge(512, 0.1);
        assert_eq!(counter.safe_limit(), 460);

        let counter = TokenCounter::openai(100, 0.25);
        assert_eq!(counter.safe_limit(), 75);
    }

    #[test]
    fn estimate_flags_oversized_text() {
        let counter = TokenCounter::with_ratio(1.0, 10, 0.0);
        assert!(counter.estimate("short").within_safe_limit);
        assert!(!counter.estimate("definitely more than ten").within_safe_limit);
    }

    #[test]
    fn caching_wrapper_agrees_with_inner() {
        let counter = CachingTokenCounter::new(TokenCounter::bge(512, 0.1), 16);
        let text = "hybrid retrieval with reciprocal rank fusion";
        let first = counter.estimate(text);
        let second = counter.estimate(text);
        assert_eq!(first, second);
        assert_eq!(first.tokens, counter.inner().count(text));
    }

    #[test]
    fn caching_wrapper_is_shareable_across_threads() {
        use std::sync::Arc;
        let counter = Arc::new(CachingTokenCounter::new(TokenCounter::bge(512, 0.1), 64));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || counter.count(&format!("text {i}")))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap() > 0);
        }
    }
}
