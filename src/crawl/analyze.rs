//! Word-frequency analysis
//!
//! Splits extracted text on Unicode word boundaries, lowercases, applies the
//! configured length bounds and optional stop-word removal, and accumulates
//! counts. Deterministic for a given input and configuration.

use std::collections::{HashMap, HashSet};

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ContentConfig;

/// Common English stop words, matched after lowercasing.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "could", "did", "do", "down", "each",
    "for", "from", "get", "go", "had", "has", "have", "he", "her", "him", "his", "how", "if",
    "in", "into", "is", "it", "its", "like", "made", "make", "many", "may", "more", "my", "no",
    "now", "of", "on", "out", "said", "she", "so", "some", "than", "that", "the", "their",
    "them", "then", "these", "they", "this", "time", "to", "two", "up", "was", "way", "what",
    "which", "who", "will", "with", "would",
];

/// Result of analyzing one page's text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WordAnalysis {
    pub frequencies: HashMap<String, u64>,
    pub total_words: u64,
    pub unique_words: u64,
}

/// Tokenizer + counter with the session's content settings baked in.
pub struct WordAnalyzer {
    min_len: usize,
    max_len: usize,
    max_words: usize,
    stop_words: Option<HashSet<&'static str>>,
}

impl WordAnalyzer {
    pub fn new(config: &ContentConfig) -> Self {
        Self {
            min_len: config.min_word_length,
            max_len: config.max_word_length,
            max_words: config.max_words_per_page,
            stop_words: config
                .strip_stopwords
                .then(|| STOP_WORDS.iter().copied().collect()),
        }
    }

    /// Count word frequencies in `text`.
    ///
    /// Counting stops once `max_words_per_page` accepted tokens have been
    /// seen; total and unique counts reflect what was counted.
    pub fn analyze(&self, text: &str) -> WordAnalysis {
        let mut frequencies: HashMap<String, u64> = HashMap::new();
        let mut total: u64 = 0;

        for word in text.unicode_words() {
            if total as usize >= self.max_words {
                break;
            }
            let len = word.chars().count();
            if len < self.min_len || len > self.max_len {
                continue;
            }
            let lower = word.to_lowercase();
            if let Some(stop) = &self.stop_words {
                if stop.contains(lower.as_str()) {
                    continue;
                }
            }
            *frequencies.entry(lower).or_insert(0) += 1;
            total += 1;
        }

        WordAnalysis {
            unique_words: frequencies.len() as u64,
            total_words: total,
            frequencies,
        }
    }
}

impl Default for WordAnalyzer {
    fn default() -> Self {
        Self::new(&ContentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> WordAnalyzer {
        WordAnalyzer::default()
    }

    #[test]
    fn test_basic_counts() {
        let analysis = analyzer().analyze("hello hello world");
        assert_eq!(analysis.frequencies.get("hello"), Some(&2));
        assert_eq!(analysis.frequencies.get("world"), Some(&1));
        assert_eq!(analysis.total_words, 3);
        assert_eq!(analysis.unique_words, 2);
    }

    #[test]
    fn test_lowercasing() {
        let analysis = analyzer().analyze("Rust RUST rust");
        assert_eq!(analysis.frequencies.get("rust"), Some(&3));
        assert_eq!(analysis.unique_words, 1);
    }

    #[test]
    fn test_length_bounds() {
        let mut config = ContentConfig::default();
        config.min_word_length = 3;
        config.max_word_length = 5;
        let analysis = WordAnalyzer::new(&config).analyze("I am the walrus absolutely");
        // "I", "am" too short; "walrus" (6) and "absolutely" too long
        assert_eq!(analysis.frequencies.len(), 1);
        assert_eq!(analysis.frequencies.get("the"), Some(&1));
    }

    #[test]
    fn test_stopword_removal() {
        let mut config = ContentConfig::default();
        config.strip_stopwords = true;
        config.min_word_length = 1;
        let analysis = WordAnalyzer::new(&config).analyze("the quick brown fox and the lazy dog");
        assert!(analysis.frequencies.get("the").is_none());
        assert!(analysis.frequencies.get("and").is_none());
        assert_eq!(analysis.frequencies.get("quick"), Some(&1));
        assert_eq!(analysis.total_words, 5);
    }

    #[test]
    fn test_word_cap() {
        let mut config = ContentConfig::default();
        config.max_words_per_page = 4;
        let analysis = WordAnalyzer::new(&config).analyze("one two three four five six");
        assert_eq!(analysis.total_words, 4);
    }

    #[test]
    fn test_punctuation_and_unicode() {
        let analysis = analyzer().analyze("donde está la biblioteca? it's here!");
        assert_eq!(analysis.frequencies.get("está"), Some(&1));
        assert_eq!(analysis.frequencies.get("it's"), Some(&1));
        assert!(analysis.frequencies.get("here!").is_none());
        assert_eq!(analysis.frequencies.get("here"), Some(&1));
    }

    #[test]
    fn test_deterministic() {
        let text = "alpha beta gamma alpha beta alpha";
        let a = analyzer().analyze(text);
        let b = analyzer().analyze(text);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input() {
        let analysis = analyzer().analyze("");
        assert_eq!(analysis.total_words, 0);
        assert!(analysis.frequencies.is_empty());
    }
}
