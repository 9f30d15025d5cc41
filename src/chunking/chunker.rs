use super::token_counter::{CachingTokenCounter, TokenCounter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    TokenAware,
    ParagraphAware,
    CharacterBased,
}

impl ChunkStrategy {
    /// Parse a configured strategy name. Unknown names degrade to
    /// token-aware without a warning.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "paragraph_aware" | "paragraph" => Self::ParagraphAware,
            "character_based" | "character" => Self::CharacterBased,
            _ => Self::TokenAware,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenAware => "token_aware",
            Self::ParagraphAware => "paragraph_aware",
            Self::CharacterBased => "character_based",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub id: String,
    pub text: String,
    pub token_count: usize,
    pub character_count: usize,
    pub start_index: usize,
    pub end_index: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub chunks: Vec<TextChunk>,
    pub total_tokens: usize,
    pub total_characters: usize,
    pub strategy: ChunkStrategy,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TextCharacteristics {
    pub characters: usize,
    pub estimated_tokens: usize,
    pub paragraph_count: usize,
    pub sentence_count: usize,
    pub avg_paragraph_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct TextAnalysis {
    pub suggested_strategy: ChunkStrategy,
    pub estimated_chunks: usize,
    pub characteristics: TextCharacteristics,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimalChunkSize {
    pub tokens: usize,
    pub characters: usize,
}

/// Splits source text into embedding-safe chunks. Sentence-first by
/// default; paragraph-aware and character-window strategies are selectable
/// per config. Every emitted chunk fits the counter's safe token budget
/// unless a `too large` warning says otherwise.
pub struct AdaptiveChunker {
    counter: CachingTokenCounter,
    strategy: ChunkStrategy,
    overlap_tokens: usize,
}

/// A contiguous span of the source text, pre-sized to fit the budget.
struct Unit {
    start: usize,
    end: usize,
}

impl AdaptiveChunker {
    pub fn new(counter: TokenCounter, strategy: ChunkStrategy, overlap_tokens: usize) -> Self {
        Self {
            counter: CachingTokenCounter::new(counter, 2048),
            strategy,
            overlap_tokens,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TokenCounter::bge(512, 0.1), ChunkStrategy::TokenAware, 0)
    }

    pub fn optimal_chunk_size(&self) -> OptimalChunkSize {
        OptimalChunkSize {
            tokens: self.counter.inner().safe_limit(),
            characters: self.counter.inner().safe_character_window(),
        }
    }

    pub fn analyze_text(&self, text: &str) -> TextAnalysis {
        let characters = text.chars().count();
        let estimated_tokens = self.counter.inner().count(text);
        let budget = self.counter.inner().safe_limit();

        let paragraphs = split_paragraphs(text);
        let sentences = split_sentences(text);
        let paragraph_count = paragraphs.len();
        let sentence_count = sentences.len();
        let avg_paragraph_tokens = if paragraph_count > 0 {
            paragraphs
                .iter()
                .map(|&(s, e)| self.counter.inner().count(&text[s..e]))
                .sum::<usize>()
                / paragraph_count
        } else {
            0
        };

        let suggested_strategy = if paragraph_count >= 3 && avg_paragraph_tokens <= budget {
            ChunkStrategy::ParagraphAware
        } else if sentence_count >= 2 {
            ChunkStrategy::TokenAware
        } else {
            ChunkStrategy::CharacterBased
        };

        let estimated_chunks = if estimated_tokens == 0 {
            0
        } else {
            estimated_tokens.div_ceil(budget.max(1))
        };

        TextAnalysis {
            suggested_strategy,
            estimated_chunks,
            characteristics: TextCharacteristics {
                characters,
                estimated_tokens,
                paragraph_count,
                sentence_count,
                avg_paragraph_tokens,
            },
        }
    }

    pub fn chunk(&self, text: &str, doc_id: &str) -> ChunkOutput {
        let mut warnings = Vec::new();

        if text.is_empty() {
            return self.output(text, doc_id, Vec::new(), warnings);
        }
        if text.trim().is_empty() {
            // Whitespace-only input is still one addressable chunk.
            let units = vec![Unit { start: 0, end: text.len() }];
            return self.output(text, doc_id, units, warnings);
        }

        let budget = self.core_budget();
        let units = match self.strategy {
            ChunkStrategy::TokenAware => self.sentence_units(text, 0, text.len(), budget, &mut warnings),
            ChunkStrategy::ParagraphAware => self.paragraph_units(text, budget, &mut warnings),
            ChunkStrategy::CharacterBased => self.character_units(text),
        };

        self.output(text, doc_id, units, warnings)
    }

    /// Budget for a chunk's core span; when overlap is on, room is reserved
    /// for the prefix carried over from the previous chunk.
    fn core_budget(&self) -> usize {
        let safe = self.counter.inner().safe_limit();
        if self.overlap_tokens > 0 {
            safe.saturating_sub(self.overlap_tokens + 2).max(1)
        } else {
            safe
        }
    }

    fn sentence_units(
        &self,
        text: &str,
        from: usize,
        to: usize,
        budget: usize,
        warnings: &mut Vec<String>,
    ) -> Vec<Unit> {
        let mut units = Vec::new();
        for (s, e) in split_sentences(&text[from..to]) {
            let (start, end) = (from + s, from + e);
            let tokens = self.counter.count(&text[start..end]);
            if tokens > budget {
                warnings.push(format!(
                    "sentence of {tokens} tokens is too large for budget {budget}; split at word boundaries"
                ));
                units.extend(self.word_units(text, start, end, budget));
            } else {
                units.push(Unit { start, end });
            }
        }
        units
    }

    fn paragraph_units(&self, text: &str, budget: usize, warnings: &mut Vec<String>) -> Vec<Unit> {
        let mut units = Vec::new();
        for (start, end) in split_paragraphs(text) {
            let tokens = self.counter.count(&text[start..end]);
            if tokens > budget {
                warnings.push(format!(
                    "paragraph of {tokens} tokens is too large for budget {budget}; falling back to sentence chunking"
                ));
                units.extend(self.sentence_units(text, start, end, budget, warnings));
            } else {
                units.push(Unit { start, end });
            }
        }
        units
    }

    /// Split an overlong span at word boundaries into budget-sized pieces.
    /// Nothing is dropped, no matter how large the span is.
    fn word_units(&self, text: &str, from: usize, to: usize, budget: usize) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut piece_start: Option<usize> = None;
        let mut piece_end = from;

        for (ws, we) in split_words(&text[from..to]) {
            let (start, end) = (from + ws, from + we);
            match piece_start {
                None => {
                    piece_start = Some(start);
                    piece_end = end;
                }
                Some(ps) => {
                    if self.counter.count(&text[ps..end]) > budget {
                        units.push(Unit { start: ps, end: piece_end });
                        piece_start = Some(start);
                    }
                    piece_end = end;
                }
            }
        }
        if let Some(ps) = piece_start {
            units.push(Unit { start: ps, end: piece_end });
        }
        units
    }

    fn character_units(&self, text: &str) -> Vec<Unit> {
        let reserve = (self.overlap_tokens as f32 * self.counter.inner().chars_per_token()) as usize;
        let window = self
            .counter
            .inner()
            .safe_character_window()
            .saturating_sub(reserve + 2)
            .max(1);

        let mut spans = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let mut end = snap_to_char_boundary(text, (start + window).min(text.len()));
            if end < text.len() {
                // Back off to the nearest word boundary inside the window.
                if let Some(pos) = text[start..end].rfind(char::is_whitespace) {
                    if pos > 0 {
                        end = start + pos;
                    }
                }
            }
            if end <= start {
                end = snap_forward(text, start + 1);
            }
            push_trimmed(text, start, end, &mut spans);
            start = end;
            while start < text.len() && text[start..].starts_with(char::is_whitespace) {
                start += text[start..].chars().next().map_or(1, |c| c.len_utf8());
            }
        }
        spans
            .into_iter()
            .map(|(start, end)| Unit { start, end })
            .collect()
    }

    fn output(&self, text: &str, doc_id: &str, units: Vec<Unit>, warnings: Vec<String>) -> ChunkOutput {
        let budget = self.core_budget();
        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut group: Option<(usize, usize)> = None;

        let flush = |chunks: &mut Vec<TextChunk>, start: usize, end: usize| {
            let core = &text[start..end];
            let chunk_text = match chunks.last() {
                Some(prev) if self.overlap_tokens > 0 => {
                    let prefix = overlap_prefix(&prev.text, self.overlap_tokens, self.counter.inner());
                    if prefix.is_empty() {
                        core.to_string()
                    } else {
                        format!("{prefix} {core}")
                    }
                }
                _ => core.to_string(),
            };
            let estimate = self.counter.inner().estimate(&chunk_text);
            chunks.push(TextChunk {
                id: format!("{doc_id}_chunk_{}", chunks.len()),
                text: chunk_text,
                token_count: estimate.tokens,
                character_count: estimate.characters,
                start_index: start,
                end_index: end,
            });
        };

        for unit in units {
            group = match group {
                None => Some((unit.start, unit.end)),
                Some((start, _end)) => {
                    if self.counter.count(&text[start..unit.end]) > budget {
                        flush(&mut chunks, start, _end);
                        Some((unit.start, unit.end))
                    } else {
                        Some((start, unit.end))
                    }
                }
            };
        }
        if let Some((start, end)) = group {
            flush(&mut chunks, start, end);
        }

        let total_tokens = chunks.iter().map(|c| c.token_count).sum();
        let total_characters = chunks.iter().map(|c| c.character_count).sum();
        ChunkOutput {
            chunks,
            total_tokens,
            total_characters,
            strategy: self.strategy,
            warnings,
        }
    }
}

/// Last few whole words of the previous chunk, within the overlap token
/// budget. Always at least one word so consecutive chunks share a word.
fn overlap_prefix(previous: &str, overlap_tokens: usize, counter: &TokenCounter) -> String {
    let words: Vec<&str> = previous.split_whitespace().collect();
    if words.is_empty() {
        return String::new();
    }
    let mut take = 1;
    while take < words.len() {
        let candidate = words[words.len() - take - 1..].join(" ");
        if counter.count(&candidate) > overlap_tokens {
            break;
        }
        take += 1;
    }
    words[words.len() - take..].join(" ")
}

/// Sentence spans (byte offsets), delimiter included, edges trimmed.
fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        let boundary = match c {
            '.' | '!' | '?' => text[i + c.len_utf8()..]
                .chars()
                .next()
                .map_or(true, |n| n.is_whitespace()),
            '\n' => true,
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            push_trimmed(text, start, end, &mut spans);
            start = end;
        }
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

/// Paragraph spans, split on blank lines.
fn split_paragraphs(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
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
                push_trimmed(text, start, i, &mut spans);
                start = j;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    push_trimmed(text, start, text.len(), &mut spans);
    spans
}

/// Whitespace-delimited word spans.
fn split_words(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn push_trimmed(text: &str, mut start: usize, mut end: usize, spans: &mut Vec<(usize, usize)>) {
    while start < end {
        let c = match text[start..].chars().next() {
            Some(c) if c.is_whitespace() => c,
            _ => break,
        };
        start += c.len_utf8();
    }
    while end > start {
        let c = match text[..end].chars().next_back() {
            Some(c) if c.is_whitespace() => c,
            _ => break,
        };
        end -= c.len_utf8();
    }
    if start < end {
        spans.push((start, end));
    }
}

fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

fn snap_forward(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p < text.len() && !text.is_char_boundary(p) {
        p += 1;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(strategy: ChunkStrategy, max_tokens: usize, overlap: usize) -> AdaptiveChunker {
        AdaptiveChunker::new(TokenCounter::with_ratio(4.0, max_tokens, 0.1), strategy, overlap)
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        let output = chunker(ChunkStrategy::TokenAware, 100, 0).chunk("", "doc1");
        assert!(output.chunks.is_empty());
        assert_eq!(output.total_tokens, 0);
    }

    #[test]
    fn whitespace_only_input_yields_one_chunk() {
        let output = chunker(ChunkStrategy::TokenAware, 100, 0).chunk("   \n\t  ", "doc1");
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].id, "doc1_chunk_0");
    }

    #[test]
    fn chunk_ids_are_unique_and_formatted() {
        let text = "First sentence here. Second sentence follows. Third one too. ".repeat(30);
        let output = chunker(ChunkStrategy::TokenAware, 40, 0).chunk(&text, "doc9");
        assert!(output.chunks.len() > 1);
        for (i, chunk) in output.chunks.iter().enumerate() {
            assert_eq!(chunk.id, format!("doc9_chunk_{i}"));
        }
    }

    #[test]
    fn chunks_respect_budget_unless_warned() {
        let text = "Short sentence. Another short one. ".repeat(40);
        let chunker = chunker(ChunkStrategy::TokenAware, 60, 0);
        let output = chunker.chunk(&text, "doc1");
        assert!(output.warnings.is_empty());
        let budget = chunker.optimal_chunk_size().tokens;
        for chunk in &output.chunks {
            assert!(chunk.token_count <= budget, "{} > {budget}", chunk.token_count);
        }
    }

    #[test]
    fn overlong_sentence_is_split_with_warning() {
        let long_sentence = format!("{} end.", "word ".repeat(400));
        let output = chunker(ChunkStrategy::TokenAware, 50, 0).chunk(&long_sentence, "doc1");
        assert!(output.chunks.len() > 1);
        assert!(output.warnings.iter().any(|w| w.contains("too large")));
        // Nothing is dropped: every word survives somewhere.
        let rejoined: String = output.chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join(" ");
        assert_eq!(rejoined.split_whitespace().count(), long_sentence.split_whitespace().count());
    }

    #[test]
    fn paragraph_strategy_recurses_on_oversize_paragraph() {
        let big_paragraph = "word ".repeat(300);
        let text = format!("Small intro paragraph.\n\n{big_paragraph}\n\nClosing paragraph here.");
        let output = chunker(ChunkStrategy::ParagraphAware, 50, 0).chunk(&text, "doc1");
        assert!(output.warnings.iter().any(|w| w.contains("too large")));
        assert!(output.chunks.len() > 3);
    }

    #[test]
    fn character_strategy_backs_off_to_word_boundary() {
        let text = "alpha beta gamma delta epsilon zeta eta theta ".repeat(20);
        let output = chunker(ChunkStrategy::CharacterBased, 30, 0).chunk(&text, "doc1");
        assert!(output.chunks.len() > 1);
        for chunk in &output.chunks {
            assert!(!chunk.text.starts_with(' '));
            assert!(!chunk.text.ends_with(' '));
        }
    }

    #[test]
    fn start_and_end_indices_are_ordered() {
        let text = "One sentence. Two sentence. Three sentence. ".repeat(20);
        let output = chunker(ChunkStrategy::TokenAware, 40, 0).chunk(&text, "doc1");
        for chunk in &output.chunks {
            assert!(chunk.start_index < chunk.end_index);
        }
    }

    #[test]
    fn overlap_shares_a_whole_word_between_consecutive_chunks() {
        let text = "alpha beta gamma delta. epsilon zeta eta theta. iota kappa lambda mu. ".repeat(12);
        let output = chunker(ChunkStrategy::TokenAware, 40, 6).chunk(&text, "doc1");
        assert!(output.chunks.len() > 1);
        for pair in output.chunks.windows(2) {
            let prev_words: std::collections::HashSet<&str> =
                pair[0].text.split_whitespace().collect();
            let shared = pair[1].text.split_whitespace().any(|w| prev_words.contains(w));
            assert!(shared, "chunks share no word: {:?}", pair[1].text);
        }
    }

    #[test]
    fn unknown_strategy_name_degrades_to_token_aware() {
        assert_eq!(ChunkStrategy::parse("quantum_entangled"), ChunkStrategy::TokenAware);
        assert_eq!(ChunkStrategy::parse("paragraph-aware"), ChunkStrategy::ParagraphAware);
        assert_eq!(ChunkStrategy::parse("character"), ChunkStrategy::CharacterBased);
    }

    #[test]
    fn analyze_text_suggests_paragraph_strategy_for_structured_text() {
        let text = "Intro paragraph with a sentence.\n\nSecond paragraph here.\n\nThird paragraph closes.";
        let analysis = chunker(ChunkStrategy::TokenAware, 200, 0).analyze_text(text);
        assert_eq!(analysis.suggested_strategy, ChunkStrategy::ParagraphAware);
        assert_eq!(analysis.characteristics.paragraph_count, 3);
        assert!(analysis.estimated_chunks >= 1);
    }

    #[test]
    fn analyze_empty_text_estimates_zero_chunks() {
        let analysis = chunker(ChunkStrategy::TokenAware, 200, 0).analyze_text("");
        assert_eq!(analysis.estimated_chunks, 0);
    }
}
