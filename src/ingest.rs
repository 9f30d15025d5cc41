//! Ingest-side chunk preparation. Turns a source document into embedded,
//! payload-complete chunks ready for upsert into the collection: space
//! assignment, table-aware section paths, budgeted chunking, batched
//! embedding and the corpus-statistics update.
//!
//! The upload front-end and the store write itself live outside the core;
//! this module produces exactly the points the retrieval side expects to
//! scroll and search.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::chunking::{AdaptiveChunker, ChunkStrategy, TokenCounter};
use crate::config::RetrievalConfig;
use crate::embeddings::Embedder;
use crate::space::{Space, SpaceManager};
use crate::stats::CorpusStatsStore;
use crate::types::Payload;

#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub doc_id: String,
    pub tenant_id: String,
    pub acl: Vec<String>,
    pub text: String,
    pub title: Option<String>,
    pub language: Option<String>,
}

/// One embedded chunk, payload shaped for the collection.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug)]
pub struct IngestOutput {
    pub chunks: Vec<PreparedChunk>,
    pub space: Space,
    pub total_tokens: usize,
    pub warnings: Vec<String>,
}

/// A contiguous block of the source document: either prose to be chunked
/// by the adaptive chunker, or a Markdown table that becomes a section.
struct Block {
    start: usize,
    end: usize,
    is_table: bool,
}

/// One chunk-to-be before embedding.
struct DraftChunk {
    text: String,
    section_path: Option<String>,
    start: usize,
    end: usize,
}

pub struct IngestPipeline {
    chunker: AdaptiveChunker,
    counter: TokenCounter,
    embedder: Arc<dyn Embedder>,
    spaces: SpaceManager,
    stats: Arc<CorpusStatsStore>,
}

impl IngestPipeline {
    pub fn new(
        config: &RetrievalConfig,
        embedder: Arc<dyn Embedder>,
        stats: Arc<CorpusStatsStore>,
    ) -> Self {
        let counter = TokenCounter::with_ratio(
            config.chunking.chars_per_token,
            config.chunking.max_tokens,
            config.chunking.safety_margin,
        );
        let chunker = AdaptiveChunker::new(
            counter,
            ChunkStrategy::parse(&config.chunking.strategy),
            config.chunking.overlap_tokens,
        );
        Self {
            chunker,
            counter,
            embedder,
            spaces: SpaceManager::new(config.data_dir.clone()),
            stats,
        }
    }

    pub fn spaces(&self) -> &SpaceManager {
        &self.spaces
    }

    /// Prepare a document for upsert: assign its space, cut it into
    /// chunks (tables become `block_<n>[/part_<k>]` sections), embed every
    /// chunk and fold the text into the tenant's corpus statistics.
    pub async fn prepare_document(&self, input: DocumentInput) -> Result<IngestOutput> {
        let space = self
            .spaces
            .resolve_space(&input.tenant_id, &input.text)
            .context("resolving space")?;

        let mut warnings = Vec::new();
        let mut drafts: Vec<DraftChunk> = Vec::new();
        let mut block_index = 0usize;

        for block in split_blocks(&input.text) {
            let body = &input.text[block.start..block.end];
            if block.is_table {
                drafts.extend(self.table_drafts(
                    body,
                    block.start,
                    block_index,
                    &mut warnings,
                ));
                block_index += 1;
            } else {
                let output = self.chunker.chunk(body, &input.doc_id);
                warnings.extend(output.warnings);
                for chunk in output.chunks {
                    drafts.push(DraftChunk {
                        text: chunk.text,
                        section_path: None,
                        start: block.start + chunk.start_index,
                        end: block.start + chunk.end_index,
                    });
                }
            }
        }

        if drafts.is_empty() && !input.text.is_empty() {
            drafts.push(DraftChunk {
                text: input.text.clone(),
                section_path: None,
                start: 0,
                end: input.text.len(),
            });
        }

        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| anyhow::anyhow!("embedding ingest batch: {e}"))?;

        self.stats
            .update_corpus_stats(std::slice::from_ref(&input.text), &input.tenant_id)
            .context("updating corpus stats")?;

        let mut total_tokens = 0usize;
        let chunks: Vec<PreparedChunk> = drafts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (draft, vector))| {
                let estimate = self.counter.estimate(&draft.text);
                total_tokens += estimate.tokens;

                let mut payload = Payload::new();
                payload.insert("tenant".into(), json!(input.tenant_id));
                payload.insert("acl".into(), json!(input.acl));
                payload.insert("docId".into(), json!(input.doc_id));
                payload.insert("spaceId".into(), json!(space.space_id));
                payload.insert("content".into(), json!(draft.text));
                payload.insert("tokenCount".into(), json!(estimate.tokens));
                payload.insert("characterCount".into(), json!(estimate.characters));
                payload.insert("startIndex".into(), json!(draft.start));
                payload.insert("endIndex".into(), json!(draft.end));
                if let Some(title) = &input.title {
                    payload.insert("header".into(), json!(title));
                }
                if let Some(language) = &input.language {
                    payload.insert("language".into(), json!(language));
                }
                if let Some(path) = &draft.section_path {
                    payload.insert("sectionPath".into(), json!(path));
                }

                PreparedChunk {
                    chunk_id: format!("{}_chunk_{index}", input.doc_id),
                    vector,
                    payload,
                }
            })
            .collect();

        tracing::info!(
            tenant = %input.tenant_id,
            doc = %input.doc_id,
            space = %space.space_id,
            chunks = chunks.len(),
            total_tokens,
            "prepared document for upsert"
        );

        Ok(IngestOutput {
            chunks,
            space,
            total_tokens,
            warnings,
        })
    }

    /// Cut a Markdown table into section parts. A table that fits the
    /// budget stays one base chunk (`block_<n>`); a larger one is split by
    /// row groups into `block_<n>/part_<k>` with the header rows repeated
    /// in every part so each part stays readable on its own.
    fn table_drafts(
        &self,
        body: &str,
        block_start: usize,
        block_index: usize,
        warnings: &mut Vec<String>,
    ) -> Vec<DraftChunk> {
        let base = format!("block_{block_index}");
        let budget = self.counter.safe_limit();

        if self.counter.count(body) <= budget {
            return vec![DraftChunk {
                text: body.to_string(),
                section_path: Some(base),
                start: block_start,
                end: block_start + body.len(),
            }];
        }

        let lines = line_spans(body);
        let header_count = if lines.len() >= 2 && is_divider_row(&body[lines[1].0..lines[1].1]) {
            2
        } else {
            1
        };
        let header_block: String = lines[..header_count.min(lines.len())]
            .iter()
            .map(|&(s, e)| &body[s..e])
            .collect::<Vec<_>>()
            .join("\n");

        let mut drafts = Vec::new();
        let mut part = 0usize;
        let mut row_start: Option<(usize, usize)> = None;
        let mut rows: Vec<&str> = Vec::new();

        let flush = |drafts: &mut Vec<DraftChunk>,
                     rows: &mut Vec<&str>,
                     span: Option<(usize, usize)>,
                     part: &mut usize| {
            let Some((start, end)) = span else { return };
            if rows.is_empty() {
                return;
            }
            let text = format!("{header_block}\n{}", rows.join("\n"));
            drafts.push(DraftChunk {
                text,
                section_path: Some(format!("{base}/part_{part}")),
                start: block_start + start,
                end: block_start + end,
            });
            rows.clear();
            *part += 1;
        };

        for &(line_start, line_end) in &lines[header_count.min(lines.len())..] {
            let row = &body[line_start..line_end];
            if row.trim().is_empty() {
                continue;
            }
            let candidate_tokens = self.counter.count(&format!(
                "{header_block}\n{}\n{row}",
                rows.join("\n")
            ));
            if !rows.is_empty() && candidate_tokens > budget {
                flush(&mut drafts, &mut rows, row_start, &mut part);
                row_start = None;
            }
            if rows.is_empty() && self.counter.count(&format!("{header_block}\n{row}")) > budget {
                warnings.push(format!(
                    "table row of {} tokens is too large for budget {budget}",
                    self.counter.count(row)
                ));
            }
            row_start = match row_start {
                None => Some((line_start, line_end)),
                Some((s, _)) => Some((s, line_end)),
            };
            rows.push(row);
        }
        flush(&mut drafts, &mut rows, row_start, &mut part);
        drafts
    }
}

/// Split the document into blank-line-delimited blocks and mark the ones
/// that look like Markdown tables (most lines carry at least two pipes).
fn split_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;

    let mut push = |start: usize, end: usize, blocks: &mut Vec<Block>| {
        let body = &text[start..end];
        if body.trim().is_empty() {
            return;
        }
        let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
        let piped = lines.iter().filter(|l| l.matches('|').count() >= 2).count();
        let is_table = lines.len() >= 2 && piped * 5 >= lines.len() * 4;
        blocks.push(Block { start, end, is_table });
    };

    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i;
            let mut newlines = 0;
            while j < bytes.len() && (bytes[j] == b'\n' || bytes[j] == b'\r') {
                if bytes[j] == b'\n' {
                    newlines += 1;
                }
                j += 1;
            }
            if newlines >= 2 {
                push(start, i, &mut blocks);
                start = j;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    push(start, text.len(), &mut blocks);
    blocks
}

fn line_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            spans.push((start, i));
            start = i + 1;
        }
    }
    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

fn is_divider_row(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed.contains('-')
        && trimmed.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrievalError;
    use crate::sections::parse_section_path;
    use async_trait::async_trait;

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, RetrievalError> {
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn pipeline(dir: &tempfile::TempDir) -> IngestPipeline {
        let mut config = RetrievalConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.chunking.max_tokens = 64;
        config.chunking.chars_per_token = 4.0;
        let stats = Arc::new(CorpusStatsStore::new(config.data_dir.clone()));
        IngestPipeline::new(&config, Arc::new(UnitEmbedder), stats)
    }

    fn input(doc_id: &str, text: &str) -> DocumentInput {
        DocumentInput {
            doc_id: doc_id.into(),
            tenant_id: "acme".into(),
            acl: vec!["engineering".into(), "public".into()],
            text: text.into(),
            title: Some("Runbook".into()),
            language: Some("en".into()),
        }
    }

    #[tokio::test]
    async fn prose_document_produces_rbac_complete_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let text = "Failover procedure for the primary database. ".repeat(20);
        let output = pipeline
            .prepare_document(input("doc1", &text))
            .await
            .unwrap();

        assert!(!output.chunks.is_empty());
        for (i, chunk) in output.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, format!("doc1_chunk_{i}"));
            assert_eq!(chunk.vector.len(), 4);
            assert_eq!(chunk.payload["tenant"], serde_json::json!("acme"));
            assert_eq!(
                chunk.payload["acl"],
                serde_json::json!(["engineering", "public"])
            );
            assert_eq!(chunk.payload["docId"], serde_json::json!("doc1"));
            assert!(chunk.payload.contains_key("spaceId"));
            let start = chunk.payload["startIndex"].as_u64().unwrap();
            let end = chunk.payload["endIndex"].as_u64().unwrap();
            assert!(start < end);
        }
    }

    #[tokio::test]
    async fn chunks_respect_the_embedding_budget() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let text = "Plain sentence for budget checks. ".repeat(60);
        let output = pipeline
            .prepare_document(input("doc1", &text))
            .await
            .unwrap();

        let budget = pipeline.counter.safe_limit();
        for chunk in &output.chunks {
            let tokens = chunk.payload["tokenCount"].as_u64().unwrap() as usize;
            assert!(tokens <= budget, "{tokens} > {budget}");
        }
    }

    #[tokio::test]
    async fn small_table_becomes_one_base_section() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let text = "Intro paragraph about limits.\n\n| name | limit |\n|---|---|\n| reads | 100 |\n| writes | 50 |";
        let output = pipeline
            .prepare_document(input("doc1", text))
            .await
            .unwrap();

        let sectioned: Vec<&PreparedChunk> = output
            .chunks
            .iter()
            .filter(|c| c.payload.contains_key("sectionPath"))
            .collect();
        assert_eq!(sectioned.len(), 1);
        let path = sectioned[0].payload["sectionPath"].as_str().unwrap();
        assert_eq!(parse_section_path(path), Some(("block_0".to_string(), None)));
    }

    #[tokio::test]
    async fn large_table_splits_into_parts_with_repeated_header() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let mut table = String::from("| metric | value | note |\n|---|---|---|");
        for i in 0..60 {
            table.push_str(&format!(
                "\n| metric_{i} | {} | steady state reading |",
                i * 10
            ));
        }
        let output = pipeline
            .prepare_document(input("doc1", &table))
            .await
            .unwrap();

        let parts: Vec<(String, Option<u32>)> = output
            .chunks
            .iter()
            .filter_map(|c| c.payload.get("sectionPath"))
            .filter_map(|v| v.as_str())
            .filter_map(parse_section_path)
            .collect();
        assert!(parts.len() > 1);
        for (i, (base, part)) in parts.iter().enumerate() {
            assert_eq!(base, "block_0");
            assert_eq!(*part, Some(i as u32));
        }
        // Every part repeats the header row.
        for chunk in &output.chunks {
            let content = chunk.payload["content"].as_str().unwrap();
            assert!(content.starts_with("| metric | value | note |"));
        }
    }

    #[tokio::test]
    async fn ingest_updates_corpus_stats_and_assigns_a_space() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let output = pipeline
            .prepare_document(input(
                "doc1",
                "Espresso machine descaling procedure with monthly cadence details.",
            ))
            .await
            .unwrap();

        assert!(output.space.auto_created);
        let stats = pipeline.stats.get("acme");
        assert_eq!(stats.total_docs, 1);
        assert!(stats.idf.contains_key("espresso"));
    }

    #[tokio::test]
    async fn empty_document_prepares_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let output = pipeline.prepare_document(input("doc1", "")).await.unwrap();
        assert!(output.chunks.is_empty());
        assert_eq!(output.total_tokens, 0);
    }
}
