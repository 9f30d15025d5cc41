use thiserror::Error;

/// Fatal failures on the query path. Everything else (a slow channel, a
/// reranker hiccup, a dropped packer candidate) degrades in place and is
/// reported through metrics and logs instead.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("caller context is missing or unknown")]
    Unauthorized,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("query embedding timed out")]
    EmbeddingTimeout,

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("search exceeded the overall deadline")]
    OverallTimeout,
}

impl RetrievalError {
    /// Short machine code carried on the error envelope. Never includes
    /// internal detail or stack traces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidConfiguration(_) => "invalid-configuration",
            Self::EmbeddingTimeout => "embedding-timeout",
            Self::EmbeddingUnavailable(_) => "embedding-unavailable",
            Self::InvalidDimension { .. } => "invalid-dimension",
            Self::OverallTimeout => "overall-timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RetrievalError::Unauthorized.code(), "unauthorized");
        assert_eq!(RetrievalError::EmbeddingTimeout.code(), "embedding-timeout");
        assert_eq!(
            RetrievalError::InvalidDimension { expected: 384, actual: 768 }.code(),
            "invalid-dimension"
        );
        assert_eq!(RetrievalError::OverallTimeout.code(), "overall-timeout");
    }

    #[test]
    fn messages_do_not_leak_internals() {
        let err = RetrievalError::EmbeddingUnavailable("connection refused".into());
        let msg = err.to_string();
        assert!(msg.contains("connection refused"));
        assert!(!msg.contains("src/"));
    }
}
