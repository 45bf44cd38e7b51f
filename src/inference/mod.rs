//! Embedding providers.
//!
//! The routing layer only sees the [`Embedder`] trait: a deterministic
//! `text -> vector` function with a fixed dimension for the life of the
//! process.

pub mod bi_encoder;
pub mod hashing;

pub use bi_encoder::BiEncoderModel;
pub use hashing::HashEmbedder;

use crate::config::{Config, EmbedderKind};
use crate::error::Result;
use std::sync::Arc;

pub trait Embedder: Send + Sync {
    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. Output order matches input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Width of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Identifies model and settings. Part of the embedding cache key, so two
    /// embedders with the same identity must produce identical vectors.
    fn identity(&self) -> String;

    /// How many `embed` calls may usefully run at once.
    fn parallelism(&self) -> usize {
        1
    }
}

/// Build the embedder selected by `config.embedder`.
pub fn from_config(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedder {
        EmbedderKind::Hash => Ok(Arc::new(HashEmbedder::new(config.embedding_dim)?)),
        EmbedderKind::Onnx => {
            let pool_size = config.pool_size.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });
            Ok(Arc::new(BiEncoderModel::load_pool(
                &config.bi_encoder_model_path,
                &config.bi_encoder_tokenizer_path,
                config.max_sequence_length,
                pool_size,
            )?))
        }
    }
}
