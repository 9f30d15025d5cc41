//! Shared query/document tokenization.
//!
//! The keyword channel and the corpus statistics must agree on what a term
//! is, so both go through this module: lowercase, split on non-word
//! characters, drop stop-words, drop tokens shorter than three characters.

/// Closed English stop-word set, fixed at build time. Multi-language text
/// passes through tokenization unchanged; only English function words are
/// filtered.
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an",
    "and", "any", "are", "as", "at", "be", "because", "been", "before",
    "being", "below", "between", "both", "but", "by", "can", "cannot",
    "could", "did", "do", "does", "doing", "down", "during", "each", "few",
    "for", "from", "further", "had", "has", "have", "having", "he", "her",
    "here", "hers", "him", "his", "how", "i", "if", "in", "into", "is", "it",
    "its", "itself", "just", "me", "more", "most", "my", "myself", "no",
    "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other",
    "our", "ours", "out", "over", "own", "same", "she", "should", "so",
    "some", "such", "than", "that", "the", "their", "theirs", "them", "then",
    "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when",
    "where", "which", "while", "who", "whom", "why", "will", "with", "would",
    "you", "your", "yours",
];

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Normalize text into content terms: lowercase, split on non-word
/// boundaries, stop-words and tokens shorter than 3 characters removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3 && !is_stop_word(t))
        .map(|t| t.to_string())
        .collect()
}

/// Like [`tokenize`] but keeps stop-words and short tokens. Used where raw
/// word positions matter (proximity windows, overlap prefixes).
pub fn raw_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Count occurrences of `term` among the tokens of `text`.
pub fn term_frequency(text: &str, term: &str) -> usize {
    raw_tokens(text).iter().filter(|t| t.as_str() == term).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_word_list_is_sorted_for_binary_search() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }

    #[test]
    fn tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("What is the TCP handshake in IPv6?");
        assert_eq!(tokens, vec!["tcp", "handshake", "ipv6"]);
    }

    #[test]
    fn tokenize_empty_query_yields_nothing() {
        assert!(tokenize("the of and a").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn term_frequency_counts_whole_words() {
        assert_eq!(term_frequency("rate limit and rate window", "rate"), 2);
        assert_eq!(term_frequency("ratelimit", "rate"), 0);
    }
}
