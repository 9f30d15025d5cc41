pub mod chunker;
pub mod token_counter;

pub use chunker::{
    AdaptiveChunker, ChunkOutput, ChunkStrategy, OptimalChunkSize, TextAnalysis, TextChunk,
};
pub use token_counter::{CachingTokenCounter, TokenCounter, TokenEstimate};
