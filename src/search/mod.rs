pub mod fusion;
pub mod keyword;

pub use fusion::{
    adaptive_weights, fuse, safe_normalize, FusionParams, FusionStrategy, FusionTrace,
    FusionTraceEntry, Normalization,
};
pub use keyword::{score_chunk, KeywordSearchOptions, KeywordSearcher};
