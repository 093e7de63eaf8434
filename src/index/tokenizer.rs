//! Term normalization for the lexical index

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Common English function words, sorted for binary search
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on",
    "or", "our", "she", "so", "such", "than", "that", "the", "their", "them", "then", "there",
    "these", "they", "this", "to", "us", "was", "we", "were", "what", "when", "which", "who",
    "will", "with", "you", "your",
];

fn term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Letters and digits in any script; everything else separates terms
        Regex::new(r"[\p{L}\p{N}]+").unwrap_or_else(|e| panic!("invalid term pattern: {e}"))
    })
}

/// Deterministic text-to-terms normalizer.
///
/// Lowercases, splits on anything that is not a letter or digit, and
/// optionally drops stopwords and short tokens. The settings are persisted
/// with index checkpoints so queries against a reloaded index tokenize the
/// same way the indexed text did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokenizer {
    #[serde(default)]
    pub remove_stopwords: bool,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

fn default_min_token_len() -> usize {
    1
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self {
            remove_stopwords: false,
            min_token_len: default_min_token_len(),
        }
    }
}

impl Tokenizer {
    pub fn new(remove_stopwords: bool, min_token_len: usize) -> Self {
        Self {
            remove_stopwords,
            min_token_len: min_token_len.max(1),
        }
    }

    /// Split text into normalized terms, in order of appearance
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        term_pattern()
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|t| t.chars().count() >= self.min_token_len)
            .filter(|t| !(self.remove_stopwords && is_stopword(t)))
            .map(str::to_string)
            .collect()
    }
}

pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.binary_search(&term).is_ok()
}
