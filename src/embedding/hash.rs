//! Deterministic hash-projection embedder.

use super::{l2_normalize, Embedder};
use crate::Result;
use sha2::{Digest, Sha256};

/// Embedder that projects token hashes into a fixed-dimension space.
///
/// Deterministic and dependency-free: the same text always maps to the
/// same unit vector, and texts sharing tokens land near each other. Used
/// when the `embeddings` feature is off and throughout the test suites.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Default embedding dimensions.
    pub const DEFAULT_DIMENSIONS: usize = 256;

    /// Creates a hash embedder with the default dimensions.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dimensions: Self::DEFAULT_DIMENSIONS,
        }
    }

    /// Creates a hash embedder with custom dimensions.
    #[must_use]
    pub const fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(raw);
        let index = usize::try_from(value % self.dimensions as u64).unwrap_or(0);
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();

        for token in &tokens {
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }
        // Token bigrams give adjacent-phrase similarity a small edge over
        // bag-of-words collisions.
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            let (index, sign) = self.bucket(&bigram);
            vector[index] += 0.5 * sign;
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("Marcus won the marathon").unwrap();
        let b = embedder.embed("Marcus won the marathon").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_norm() {
        let embedder = HashEmbedder::new();
        let v = embedder.embed("a short text").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_texts_closer_than_unrelated() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("the cat sat on the mat").unwrap();
        let b = embedder.embed("the cat sat on the rug").unwrap();
        let c = embedder.embed("quarterly revenue exceeded forecasts").unwrap();
        let sim = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f32>();
        assert!(sim(&a, &b) > sim(&a, &c));
    }

    #[test]
    fn test_batch_preserves_order_and_length() {
        let embedder = HashEmbedder::new();
        let out = embedder.embed_batch(&["one", "two", "three"]).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], embedder.embed("one").unwrap());
    }
}
