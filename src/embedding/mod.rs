//! Embedding generation.
//!
//! Provides embedding generation using fastembed (behind the `embeddings`
//! feature) or the deterministic hash-projection fallback.

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]

mod hash;

#[cfg(feature = "embeddings")]
mod fastembed;

pub use hash::HashEmbedder;

#[cfg(feature = "embeddings")]
pub use fastembed::FastEmbedEmbedder;

use crate::Result;

/// Trait for embedding generators.
///
/// Implementations must be safe to call concurrently; model-backed
/// implementations typically guard a single model handle internally.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates a unit-normalized embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts.
    ///
    /// Output length equals input length and order is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Scales a vector to unit L2 norm in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
