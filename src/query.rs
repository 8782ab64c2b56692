use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::tokenizer::Tokenizer;
use crate::vectorize::{VectorBundle, VectorizerSet};

/// Kinds of search queries, auto-detected from the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Keyword,
    Phrase,
    Semantic,
    Fuzzy,
    Filename,
    Combined,
}

/// A parsed and vectorized query ready for fan-out.
#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    pub original: String,
    pub query_type: QueryType,
    pub tokens: Vec<String>,
    pub normalized: String,
    pub keywords: Vec<String>,
    pub phrases: Vec<String>,
    pub filters: HashMap<String, String>,
    pub vectors: VectorBundle,
    pub processing_ms: f64,
}

/// Parses, normalizes and vectorizes queries with the same tokenizer the
/// index uses, so query terms line up with posting terms.
pub struct QueryProcessor {
    tokenizer: Tokenizer,
    vectorizers: Arc<VectorizerSet>,
    min_token_length: usize,
    max_query_tokens: usize,
}

impl QueryProcessor {
    pub fn new(
        vectorizers: Arc<VectorizerSet>,
        min_token_length: usize,
        max_query_tokens: usize,
    ) -> Self {
        QueryProcessor {
            tokenizer: Tokenizer::new(None, min_token_length),
            vectorizers,
            min_token_length,
            max_query_tokens,
        }
    }

    pub fn process(&self, query: &str, query_type: Option<QueryType>) -> ProcessedQuery {
        let started = Instant::now();

        let query_type = query_type.unwrap_or_else(|| detect_query_type(query));
        let (filters, remainder) = extract_filters(query);
        let (phrases, remainder) = extract_phrases(&remainder);

        let normalized = crate::tokenizer::normalize(&remainder);
        let mut tokens: Vec<String> = normalized
            .split_whitespace()
            .filter(|t| t.len() >= self.min_token_length)
            .map(|t| t.to_string())
            .collect();
        tokens.truncate(self.max_query_tokens);

        let keywords: Vec<String> =
            tokens.iter().filter(|t| !self.tokenizer.is_stopword(t)).cloned().collect();

        // Phrases contribute to the vector text even though they are
        // matched verbatim
        let mut vector_text = normalized.clone();
        for phrase in &phrases {
            vector_text.push(' ');
            vector_text.push_str(phrase);
        }
        let vectors = self.vectorizers.bundle(&vector_text);

        ProcessedQuery {
            original: query.to_string(),
            query_type,
            tokens,
            normalized,
            keywords,
            phrases,
            filters,
            vectors,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Expand keywords with synonyms, deduplicating while keeping order.
    pub fn expand(&self, mut query: ProcessedQuery, synonyms: &HashMap<String, Vec<String>>) -> ProcessedQuery {
        let mut expanded = Vec::new();
        for keyword in &query.keywords {
            if !expanded.contains(keyword) {
                expanded.push(keyword.clone());
            }
            if let Some(extra) = synonyms.get(keyword) {
                for synonym in extra {
                    if !expanded.contains(synonym) {
                        expanded.push(synonym.clone());
                    }
                }
            }
        }
        query.keywords = expanded;
        query
    }
}

/// Auto-detect the query type:
/// quotes => phrase, trailing `.ext` => filename, `~` => fuzzy, any
/// filter => combined, more than three words => semantic, else keyword.
pub fn detect_query_type(query: &str) -> QueryType {
    if query.contains('"') {
        return QueryType::Phrase;
    }

    if let Some(last) = query.split_whitespace().last() {
        if let Some((stem, ext)) = last.rsplit_once('.') {
            if !stem.is_empty()
                && (2..=4).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return QueryType::Filename;
            }
        }
    }

    if query.contains('~') {
        return QueryType::Fuzzy;
    }

    if query.split_whitespace().any(is_filter_token) {
        return QueryType::Combined;
    }

    if query.split_whitespace().count() > 3 {
        return QueryType::Semantic;
    }

    QueryType::Keyword
}

fn is_filter_token(token: &str) -> bool {
    match token.split_once(':') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Pull `key:value` filters out of the query, returning the remainder.
pub fn extract_filters(query: &str) -> (HashMap<String, String>, String) {
    let mut filters = HashMap::new();
    let mut remainder = Vec::new();

    for token in query.split_whitespace() {
        match token.split_once(':') {
            Some((key, value)) if is_filter_token(token) => {
                filters.insert(key.to_lowercase(), value.to_string());
            }
            _ => remainder.push(token),
        }
    }

    (filters, remainder.join(" "))
}

/// Pull quoted phrases out of the query, returning the remainder.
pub fn extract_phrases(query: &str) -> (Vec<String>, String) {
    let mut phrases = Vec::new();
    let mut remainder = String::new();
    let mut in_phrase = false;
    let mut current = String::new();

    for c in query.chars() {
        if c == '"' {
            if in_phrase {
                let phrase = current.trim().to_string();
                if !phrase.is_empty() {
                    phrases.push(phrase);
                }
                current.clear();
            }
            in_phrase = !in_phrase;
        } else if in_phrase {
            current.push(c);
        } else {
            remainder.push(c);
        }
    }

    // Unterminated quote: treat the tail as plain text
    if in_phrase && !current.trim().is_empty() {
        remainder.push(' ');
        remainder.push_str(current.trim());
    }

    let remainder = remainder.split_whitespace().collect::<Vec<_>>().join(" ");
    (phrases, remainder)
}
