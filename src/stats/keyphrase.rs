//! Query keyphrase extraction from corpus statistics.

use serde::{Deserialize, Serialize};

use super::CorpusStats;
use crate::text::tokenize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPhrases {
    pub tokens: Vec<String>,
    pub phrases: Vec<String>,
}

/// Unigrams after normalization, plus bi/tri-grams whose elements all
/// carry above-threshold IDF and whose adjacent pairs associate strongly
/// (PMI at or above the threshold).
pub fn extract_keyphrases(
    query: &str,
    stats: &CorpusStats,
    idf_threshold: f64,
    pmi_threshold: f64,
) -> QueryPhrases {
    let tokens = tokenize(query);
    let mut phrases = Vec::new();

    let salient = |term: &str| stats.idf_of(term) >= idf_threshold;
    let associated = |a: &str, b: &str| stats.pmi_of(a, b) >= pmi_threshold;

    for window in tokens.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        if salient(a) && salient(b) && associated(a, b) {
            phrases.push(format!("{a} {b}"));
        }
    }

    for window in tokens.windows(3) {
        let (a, b, c) = (&window[0], &window[1], &window[2]);
        if salient(a)
            && salient(b)
            && salient(c)
            && associated(a, b)
            && associated(b, c)
        {
            phrases.push(format!("{a} {b} {c}"));
        }
    }

    QueryPhrases { tokens, phrases }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stats_with(pairs: &[(&str, &str, f64)], idf: &[(&str, f64)]) -> CorpusStats {
        let mut stats = CorpusStats::default();
        for (term, value) in idf {
            stats.idf.insert(term.to_string(), *value);
        }
        for (a, b, value) in pairs {
            stats
                .pmi
                .entry(a.to_string())
                .or_insert_with(HashMap::new)
                .insert(b.to_string(), *value);
            stats
                .pmi
                .entry(b.to_string())
                .or_insert_with(HashMap::new)
                .insert(a.to_string(), *value);
        }
        stats
    }

    #[test]
    fn associated_salient_bigram_becomes_a_phrase() {
        let stats = stats_with(
            &[("machine", "learning", 3.0)],
            &[("machine", 2.6), ("learning", 2.8)],
        );
        let result = extract_keyphrases("machine learning basics", &stats, 2.5, 2.0);
        assert_eq!(result.tokens, vec!["machine", "learning", "basics"]);
        assert_eq!(result.phrases, vec!["machine learning"]);
    }

    #[test]
    fn weak_pmi_pair_is_not_a_phrase() {
        let stats = stats_with(
            &[("random", "words", 0.1)],
            &[("random", 3.0), ("words", 3.0)],
        );
        let result = extract_keyphrases("random words", &stats, 2.5, 2.0);
        assert!(result.phrases.is_empty());
    }

    #[test]
    fn trigram_requires_both_adjacent_pairs() {
        let stats = stats_with(
            &[("deep", "neural", 3.0), ("neural", "network", 3.5)],
            &[("deep", 2.6), ("neural", 2.9), ("network", 2.7)],
        );
        let result = extract_keyphrases("deep neural network", &stats, 2.5, 2.0);
        assert!(result.phrases.contains(&"deep neural".to_string()));
        assert!(result.phrases.contains(&"neural network".to_string()));
        assert!(result.phrases.contains(&"deep neural network".to_string()));
    }

    #[test]
    fn empty_query_extracts_nothing() {
        let result = extract_keyphrases("the of and", &CorpusStats::default(), 2.5, 2.0);
        assert!(result.tokens.is_empty());
        assert!(result.phrases.is_empty());
    }
}
