//! FastEmbed-based embedder (local ONNX inference).

use super::{l2_normalize, Embedder};
use crate::{Error, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Mutex;

/// FastEmbed embedder using all-MiniLM-L6-v2.
///
/// The ONNX session is not safe for concurrent use, so a mutex guards the
/// single model handle; callers queue on it.
pub struct FastEmbedEmbedder {
    model: Mutex<TextEmbedding>,
    dimensions: usize,
}

impl FastEmbedEmbedder {
    /// Default embedding dimensions for all-MiniLM-L6-v2.
    pub const DEFAULT_DIMENSIONS: usize = 384;

    /// Creates a new FastEmbed embedder, downloading the model on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be initialized.
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::op("fastembed_init", e))?;

        Ok(Self {
            model: Mutex::new(model),
            dimensions: Self::DEFAULT_DIMENSIONS,
        })
    }
}

impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text])?;
        batch
            .pop()
            .ok_or_else(|| Error::op("fastembed_embed", "empty embedding batch"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self
            .model
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::op("fastembed_embed", e))?;
        for embedding in &mut embeddings {
            l2_normalize(embedding);
        }
        Ok(embeddings)
    }
}
