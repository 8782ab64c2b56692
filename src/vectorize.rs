use serde::{Deserialize, Serialize};

use crate::tokenizer::Tokenizer;

/// Vector representations attached to a document or query.
///
/// The concrete vectorization algorithms are pluggable; the core only
/// stores and transports whichever representations the configured
/// vectorizers produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VectorBundle {
    pub tfidf: Option<Vec<f32>>,
    pub minhash: Option<Vec<u64>>,
    pub lda: Option<Vec<f32>>,
    pub textrank: Option<Vec<(String, f32)>>,
}

impl VectorBundle {
    pub fn is_empty(&self) -> bool {
        self.tfidf.is_none() && self.minhash.is_none() && self.lda.is_none() && self.textrank.is_none()
    }
}

/// A vectorization algorithm. Implementations fill in the bundle fields
/// they know how to compute and leave the rest untouched.
pub trait Vectorizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn vectorize(&self, text: &str, bundle: &mut VectorBundle);
}

/// An ordered set of vectorizers applied to the same text.
pub struct VectorizerSet {
    vectorizers: Vec<Box<dyn Vectorizer>>,
}

impl VectorizerSet {
    pub fn new(vectorizers: Vec<Box<dyn Vectorizer>>) -> Self {
        VectorizerSet { vectorizers }
    }

    /// Default set: feature-hashed term frequencies plus minhash signatures.
    pub fn standard() -> Self {
        VectorizerSet::new(vec![
            Box::new(HashingTfVectorizer::new(256)),
            Box::new(MinHashVectorizer::new(32)),
        ])
    }

    pub fn bundle(&self, text: &str) -> VectorBundle {
        let mut bundle = VectorBundle::default();
        for v in &self.vectorizers {
            v.vectorize(text, &mut bundle);
        }
        bundle
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.vectorizers.iter().map(|v| v.name()).collect()
    }
}

fn term_hash(term: &str, salt: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&salt.to_le_bytes());
    hasher.update(term.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Feature-hashing term-frequency vectorizer: terms are hashed into a
/// fixed-width vector of normalized counts.
pub struct HashingTfVectorizer {
    dimensions: usize,
    tokenizer: Tokenizer,
}

impl HashingTfVectorizer {
    pub fn new(dimensions: usize) -> Self {
        HashingTfVectorizer { dimensions, tokenizer: Tokenizer::default() }
    }
}

impl Vectorizer for HashingTfVectorizer {
    fn name(&self) -> &'static str {
        "tfidf"
    }

    fn vectorize(&self, text: &str, bundle: &mut VectorBundle) {
        let tokens = self.tokenizer.tokenize(text);
        if tokens.is_empty() {
            bundle.tfidf = Some(vec![0.0; self.dimensions]);
            return;
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            let slot = (term_hash(token, 0) as usize) % self.dimensions;
            vector[slot] += 1.0;
        }

        let total = tokens.len() as f32;
        for value in &mut vector {
            *value /= total;
        }
        bundle.tfidf = Some(vector);
    }
}

/// MinHash signature vectorizer for near-duplicate detection.
pub struct MinHashVectorizer {
    num_hashes: usize,
    tokenizer: Tokenizer,
}

impl MinHashVectorizer {
    pub fn new(num_hashes: usize) -> Self {
        MinHashVectorizer { num_hashes, tokenizer: Tokenizer::default() }
    }
}

impl Vectorizer for MinHashVectorizer {
    fn name(&self) -> &'static str {
        "minhash"
    }

    fn vectorize(&self, text: &str, bundle: &mut VectorBundle) {
        let terms = self.tokenizer.unique_terms(text);
        if terms.is_empty() {
            bundle.minhash = Some(vec![u64::MAX; self.num_hashes]);
            return;
        }

        let mut signature = vec![u64::MAX; self.num_hashes];
        for term in &terms {
            for (i, slot) in signature.iter_mut().enumerate() {
                let h = term_hash(term, i as u64 + 1);
                if h < *slot {
                    *slot = h;
                }
            }
        }
        bundle.minhash = Some(signature);
    }
}

/// Estimated Jaccard similarity of two minhash signatures.
pub fn minhash_similarity(a: &[u64], b: &[u64]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matching = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    matching as f32 / a.len() as f32
}

/// Cosine similarity of two dense vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_set_fills_bundle() {
        let set = VectorizerSet::standard();
        let bundle = set.bundle("distributed search engine");
        assert!(bundle.tfidf.is_some());
        assert!(bundle.minhash.is_some());
        assert!(!bundle.is_empty());
    }

    #[test]
    fn test_vectorization_deterministic() {
        let set = VectorizerSet::standard();
        assert_eq!(set.bundle("hello world"), set.bundle("hello world"));
    }

    #[test]
    fn test_minhash_similarity_identical_text() {
        let v = MinHashVectorizer::new(32);
        let mut a = VectorBundle::default();
        let mut b = VectorBundle::default();
        v.vectorize("rust distributed systems", &mut a);
        v.vectorize("rust distributed systems", &mut b);
        let sim = minhash_similarity(a.minhash.as_ref().unwrap(), b.minhash.as_ref().unwrap());
        assert!((sim - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_minhash_similarity_disjoint_text() {
        let v = MinHashVectorizer::new(32);
        let mut a = VectorBundle::default();
        let mut b = VectorBundle::default();
        v.vectorize("alpha beta gamma", &mut a);
        v.vectorize("delta epsilon zeta", &mut b);
        let sim = minhash_similarity(a.minhash.as_ref().unwrap(), b.minhash.as_ref().unwrap());
        assert!(sim < 0.5);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < f32::EPSILON);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_tf_vector_normalized() {
        let v = HashingTfVectorizer::new(64);
        let mut bundle = VectorBundle::default();
        v.vectorize("search index search", &mut bundle);
        let sum: f32 = bundle.tfidf.unwrap().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}
