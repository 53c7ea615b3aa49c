//! Text Embeddings
//!
//! The cache only needs two capabilities: turn text into a vector and score
//! two vectors. [`Embedder`] captures both so a model-backed embedder can
//! replace the built-in [`HashingEmbedder`] without touching the cache.

use thiserror::Error;

/// Embedding failure; the cache treats it as a miss or a skipped store
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Nothing to embed after tokenization
    #[error("no tokens in input")]
    EmptyInput,

    /// Embedder-specific failure
    #[error("embedding failed: {0}")]
    Failed(String),
}

/// Similarity embedding capability
pub trait Embedder: Send + Sync {
    /// Compute the embedding of `text`
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Similarity of two embeddings in `[-1, 1]`, 1 meaning identical
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine(a, b)
    }
}

/// Cosine similarity; zero for mismatched or zero-length vectors
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Feature-hashing embedder over word unigrams and bigrams
///
/// Words are lowercased alphanumeric runs. Each feature is hashed with CRC32
/// into one of `dimensions` buckets; one hash bit picks the sign so that
/// collisions tend to cancel. The result is L2-normalised.
#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// Default vector width
    pub const DEFAULT_DIMENSIONS: usize = 512;

    /// Create an embedder with `dimensions` buckets (at least 1)
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Vector width
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str) {
        let hash = crc32fast::hash(feature.as_bytes());
        let index = (hash as usize) % self.dimensions;
        let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let words = tokenize(text);
        if words.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for word in &words {
            self.add_feature(&mut vector, word);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]));
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILING: &str = "Acme Corp reported quarterly revenue of 4.2 billion dollars, \
        beating analyst estimates, while raising full year guidance on strong demand \
        for its cloud services and cutting operating costs across the retail division";

    #[test]
    fn test_identical_text_scores_one() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed(FILING).unwrap();
        let b = embedder.embed(&FILING.to_uppercase()).unwrap();
        assert!((embedder.similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_near_duplicate_scores_high() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed(FILING).unwrap();
        let b = embedder.embed(&format!("{FILING} today")).unwrap();
        assert!(embedder.similarity(&a, &b) >= 0.95);
    }

    #[test]
    fn test_unrelated_text_scores_low() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed(FILING).unwrap();
        let b = embedder
            .embed("Regulators opened an investigation into the merger of two regional banks")
            .unwrap();
        assert!(embedder.similarity(&a, &b) < 0.5);
    }

    #[test]
    fn test_empty_input() {
        let embedder = HashingEmbedder::default();
        assert_eq!(embedder.embed("  ,;  ").unwrap_err(), EmbeddingError::EmptyInput);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
