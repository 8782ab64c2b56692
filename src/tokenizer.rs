use std::collections::HashSet;

/// English stopwords filtered out of document and query text.
const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "as", "is", "was", "are",
    "were", "been", "be", "have", "has", "had", "do", "does", "did",
    "will", "would", "could", "should", "may", "might", "can",
    "this", "that", "these", "those", "it", "its", "they", "them",
];

/// Text tokenizer shared by the inverted index and the query parser.
///
/// Lowercases, strips punctuation, drops stopwords and tokens shorter than
/// `min_length`.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    stopwords: HashSet<String>,
    min_length: usize,
}

impl Tokenizer {
    pub fn new(stopwords: Option<HashSet<String>>, min_length: usize) -> Self {
        let stopwords = stopwords
            .unwrap_or_else(|| DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect());
        Tokenizer { stopwords, min_length }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        normalize(text)
            .split_whitespace()
            .filter(|t| t.len() >= self.min_length && !self.stopwords.contains(*t))
            .map(|t| t.to_string())
            .collect()
    }

    pub fn unique_terms(&self, text: &str) -> HashSet<String> {
        self.tokenize(text).into_iter().collect()
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Tokenizer::new(None, 2)
    }
}

/// Lowercase and replace everything but letters and digits with spaces.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_strips_punctuation() {
        let tokenizer = Tokenizer::default();
        let tokens = tokenizer.tokenize("Hello, World! Rust-based search.");
        assert_eq!(tokens, vec!["hello", "world", "rust", "based", "search"]);
    }

    #[test]
    fn test_stopwords_filtered() {
        let tokenizer = Tokenizer::default();
        let tokens = tokenizer.tokenize("the quick and the dead");
        assert_eq!(tokens, vec!["quick", "dead"]);
    }

    #[test]
    fn test_min_length_filter() {
        let tokenizer = Tokenizer::default();
        let tokens = tokenizer.tokenize("x y distributed z systems");
        assert_eq!(tokens, vec!["distributed", "systems"]);
    }

    #[test]
    fn test_unique_terms() {
        let tokenizer = Tokenizer::default();
        let terms = tokenizer.unique_terms("search search index search");
        assert_eq!(terms.len(), 2);
        assert!(terms.contains("search"));
        assert!(terms.contains("index"));
    }

    #[test]
    fn test_custom_stopwords() {
        let custom: HashSet<String> = ["foo".to_string()].into_iter().collect();
        let tokenizer = Tokenizer::new(Some(custom), 2);
        let tokens = tokenizer.tokenize("foo bar the");
        // "the" is only a stopword in the default set
        assert_eq!(tokens, vec!["bar", "the"]);
    }

    #[test]
    fn test_numbers_kept() {
        let tokenizer = Tokenizer::default();
        assert_eq!(tokenizer.tokenize("error 404 page"), vec!["error", "404", "page"]);
    }
}
