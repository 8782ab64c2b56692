use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;
use crate::persist;
use crate::tokenizer::Tokenizer;

/// One entry in a term's posting list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: Uuid,
    /// Normalized in-document term frequency
    pub score: f32,
}

/// Terms gained and lost by an index mutation. Forwarded to the shard
/// coordinators so the global term locator stays consistent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Per-node inverted index and document store.
///
/// Invariant: every posting references a stored document and every stored
/// document's terms appear in the index. Mutations keep both maps in step;
/// callers wrap the index in a read/write lock so readers never observe a
/// half-inserted document.
pub struct InvertedIndex {
    index: HashMap<String, Vec<Posting>>,
    documents: HashMap<Uuid, Document>,
    tokenizer: Tokenizer,
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    index: HashMap<String, Vec<Posting>>,
    documents: HashMap<Uuid, Document>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        InvertedIndex {
            index: HashMap::new(),
            documents: HashMap::new(),
            tokenizer: Tokenizer::default(),
        }
    }

    /// Index a document, replacing any previous version of the same id.
    pub fn add_document(&mut self, doc: Document) -> IndexDelta {
        let removed = if self.documents.contains_key(&doc.doc_id) {
            self.remove_document(&doc.doc_id).removed
        } else {
            Vec::new()
        };

        let tokens = self.tokenizer.tokenize(&doc.content);
        let total = tokens.len();

        let mut term_freq: HashMap<String, usize> = HashMap::new();
        for token in tokens {
            *term_freq.entry(token).or_insert(0) += 1;
        }

        let mut added: Vec<String> = Vec::with_capacity(term_freq.len());
        for (term, freq) in term_freq {
            let score = if total > 0 { freq as f32 / total as f32 } else { 0.0 };
            self.index
                .entry(term.clone())
                .or_default()
                .push(Posting { doc_id: doc.doc_id, score });
            added.push(term);
        }

        log::debug!("indexed document {}: {} unique terms", doc.doc_id, added.len());
        self.documents.insert(doc.doc_id, doc);

        // A term both removed and re-added nets out to no delta.
        let removed: Vec<String> = removed.into_iter().filter(|t| !added.contains(t)).collect();
        IndexDelta { added, removed }
    }

    /// Remove a document. The delta's `removed` lists terms whose posting
    /// lists became empty on this node.
    pub fn remove_document(&mut self, doc_id: &Uuid) -> IndexDelta {
        if !self.documents.contains_key(doc_id) {
            return IndexDelta::default();
        }

        let mut removed = Vec::new();
        self.index.retain(|term, postings| {
            postings.retain(|p| p.doc_id != *doc_id);
            if postings.is_empty() {
                removed.push(term.clone());
                false
            } else {
                true
            }
        });

        self.documents.remove(doc_id);
        log::debug!("removed document {}: {} terms emptied", doc_id, removed.len());
        IndexDelta { added: Vec::new(), removed }
    }

    /// Accumulate posting scores across query terms, top-k descending.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(Uuid, f32)> {
        let query_terms = self.tokenizer.tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut doc_scores: HashMap<Uuid, f32> = HashMap::new();
        for term in &query_terms {
            if let Some(postings) = self.index.get(term) {
                for posting in postings {
                    *doc_scores.entry(posting.doc_id).or_insert(0.0) += posting.score;
                }
            }
        }

        let mut results: Vec<(Uuid, f32)> = doc_scores.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        results
    }

    /// Terms of the query matched by a specific document.
    pub fn matched_terms(&self, query: &str, doc_id: &Uuid) -> Vec<String> {
        self.tokenizer
            .tokenize(query)
            .into_iter()
            .filter(|term| {
                self.index
                    .get(term)
                    .map(|ps| ps.iter().any(|p| p.doc_id == *doc_id))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn get_document(&self, doc_id: &Uuid) -> Option<&Document> {
        self.documents.get(doc_id)
    }

    pub fn get_document_mut(&mut self, doc_id: &Uuid) -> Option<&mut Document> {
        self.documents.get_mut(doc_id)
    }

    pub fn contains(&self, doc_id: &Uuid) -> bool {
        self.documents.contains_key(doc_id)
    }

    pub fn has_term(&self, term: &str) -> bool {
        self.index.contains_key(term)
    }

    pub fn terms(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn term_count(&self) -> usize {
        self.index.len()
    }

    pub fn document_ids(&self) -> Vec<Uuid> {
        self.documents.keys().copied().collect()
    }

    pub fn documents_in_partition(&self, partition_id: u32) -> Vec<Uuid> {
        self.documents
            .values()
            .filter(|d| d.partition_id == partition_id)
            .map(|d| d.doc_id)
            .collect()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn stats(&self) -> IndexStats {
        let total_postings: usize = self.index.values().map(|p| p.len()).sum();
        IndexStats {
            num_terms: self.index.len(),
            num_documents: self.documents.len(),
            avg_postings_per_term: if self.index.is_empty() {
                0.0
            } else {
                total_postings as f64 / self.index.len() as f64
            },
        }
    }

    /// Persist postings and documents under `dir` (crash-consistent).
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let snapshot = IndexSnapshot {
            index: self.index.clone(),
            documents: self.documents.clone(),
        };
        persist::save_bincode(&dir.join("postings"), &snapshot)
    }

    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut idx = InvertedIndex::new();
        if let Some(snapshot) = persist::load_bincode::<IndexSnapshot>(&dir.join("postings"))? {
            idx.index = snapshot.index;
            idx.documents = snapshot.documents;
        }
        Ok(idx)
    }

    /// Check the posting/document cross-reference invariant. Used by tests
    /// and the health probe.
    pub fn verify_consistency(&self) -> Result<(), String> {
        for (term, postings) in &self.index {
            if postings.is_empty() {
                return Err(format!("empty posting list for term '{}'", term));
            }
            for posting in postings {
                if !self.documents.contains_key(&posting.doc_id) {
                    return Err(format!(
                        "posting for term '{}' references missing document {}",
                        term, posting.doc_id
                    ));
                }
            }
        }
        for doc in self.documents.values() {
            for term in self.tokenizer.unique_terms(&doc.content) {
                let present = self
                    .index
                    .get(&term)
                    .map(|ps| ps.iter().any(|p| p.doc_id == doc.doc_id))
                    .unwrap_or(false);
                if !present {
                    return Err(format!(
                        "document {} term '{}' missing from index",
                        doc.doc_id, term
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for InvertedIndex {
    fn default() -> Self {
        InvertedIndex::new()
    }
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub num_terms: usize,
    pub num_documents: usize,
    pub avg_postings_per_term: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectorize::VectorBundle;
    use std::collections::HashMap as Map;

    fn doc(content: &str) -> Document {
        Document::new(Uuid::new_v4(), content.to_string(), Map::new(), 0, 1, VectorBundle::default())
    }

    #[test]
    fn test_add_and_search() {
        let mut idx = InvertedIndex::new();
        let d1 = doc("rust is a systems programming language");
        let d2 = doc("python is a scripting language");
        let id1 = d1.doc_id;

        idx.add_document(d1);
        idx.add_document(d2);

        let results = idx.search("rust systems", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id1);

        let results = idx.search("language", 10);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_scores_are_normalized_term_frequency() {
        let mut idx = InvertedIndex::new();
        let d = doc("alpha alpha beta");
        let id = d.doc_id;
        idx.add_document(d);

        let results = idx.search("alpha", 10);
        assert_eq!(results[0].0, id);
        assert!((results[0].1 - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_remove_document_drops_empty_terms() {
        let mut idx = InvertedIndex::new();
        let d = doc("unique singular token");
        let id = d.doc_id;
        let delta = idx.add_document(d);
        assert_eq!(delta.added.len(), 3);

        let delta = idx.remove_document(&id);
        assert_eq!(delta.removed.len(), 3);
        assert_eq!(idx.term_count(), 0);
        assert_eq!(idx.document_count(), 0);
        assert!(idx.search("unique", 10).is_empty());
    }

    #[test]
    fn test_reindex_replaces_previous_version() {
        let mut idx = InvertedIndex::new();
        let mut d = doc("original words here");
        let id = d.doc_id;
        idx.add_document(d.clone());

        d.update_content("replacement text".to_string(), VectorBundle::default());
        let delta = idx.add_document(d);

        assert!(delta.added.contains(&"replacement".to_string()));
        assert!(delta.removed.contains(&"original".to_string()));
        assert!(idx.search("original", 10).is_empty());
        assert_eq!(idx.search("replacement", 10)[0].0, id);
        assert_eq!(idx.document_count(), 1);
    }

    #[test]
    fn test_search_ranks_by_accumulated_score() {
        let mut idx = InvertedIndex::new();
        let both = doc("storage engine storage engine");
        let one = doc("storage only plus lots of other padding words");
        let both_id = both.doc_id;
        idx.add_document(both);
        idx.add_document(one);

        let results = idx.search("storage engine", 10);
        assert_eq!(results[0].0, both_id);
    }

    #[test]
    fn test_top_k_truncation() {
        let mut idx = InvertedIndex::new();
        for i in 0..20 {
            idx.add_document(doc(&format!("common term document number{}", i)));
        }
        assert_eq!(idx.search("common", 5).len(), 5);
    }

    #[test]
    fn test_consistency_invariant() {
        let mut idx = InvertedIndex::new();
        for i in 0..10 {
            idx.add_document(doc(&format!("document body text sample{}", i)));
        }
        idx.verify_consistency().unwrap();

        let ids = idx.document_ids();
        idx.remove_document(&ids[0]);
        idx.verify_consistency().unwrap();
    }

    #[test]
    fn test_matched_terms() {
        let mut idx = InvertedIndex::new();
        let d = doc("distributed search engine");
        let id = d.doc_id;
        idx.add_document(d);

        let mut matched = idx.matched_terms("distributed engine missing", &id);
        matched.sort();
        assert_eq!(matched, vec!["distributed", "engine"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = InvertedIndex::new();
        let d = doc("persisted document content");
        let id = d.doc_id;
        idx.add_document(d);
        idx.save(dir.path()).unwrap();

        let loaded = InvertedIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.document_count(), 1);
        assert_eq!(loaded.search("persisted", 10)[0].0, id);
        loaded.verify_consistency().unwrap();
    }
}
