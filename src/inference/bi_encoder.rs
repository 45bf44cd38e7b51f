//! Bi-encoder model for semantic embeddings.
//!
//! Encodes text with an ONNX sentence-embedding model (BGE / MiniLM family),
//! mean-pooling the last hidden state over non-padding tokens and
//! L2-normalizing the result.

use crate::error::{AppError, Result};
use crate::inference::Embedder;
use crossbeam::queue::ArrayQueue;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tokenizers::Tokenizer;

/// A pool of bi-encoder sessions.
///
/// `Session::run` needs `&mut Session`. Each session sits behind its own
/// mutex and its index is handed out through a lock-free queue, so a session
/// is held by at most one caller and the mutex is never contended. Callers
/// bound their concurrency to [`Embedder::parallelism`]; exceeding it yields
/// `ResourceError` rather than blocking.
pub struct BiEncoderModel {
    sessions: Vec<Mutex<Session>>,
    available: ArrayQueue<usize>,
    tokenizer: Tokenizer,
    max_length: usize,
    embedding_dim: usize,
    model_id: String,
}

/// Returns the session index to the pool on drop, including on error paths.
struct SessionLease<'a> {
    pool: &'a ArrayQueue<usize>,
    idx: usize,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let _ = self.pool.push(self.idx);
    }
}

impl BiEncoderModel {
    /// Load `pool_size` sessions of the model plus its tokenizer, then probe
    /// the embedding width with a warmup encode.
    pub fn load_pool(
        model_path: &Path,
        tokenizer_path: &Path,
        max_length: usize,
        pool_size: usize,
    ) -> Result<Self> {
        let pool_size = pool_size.max(1);

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            AppError::EmbeddingError(format!("Failed to load bi-encoder tokenizer: {}", e))
        })?;

        let model_bytes = std::fs::read(model_path).map_err(|e| {
            AppError::EmbeddingError(format!("Failed to read bi-encoder model: {}", e))
        })?;

        let mut sessions = Vec::with_capacity(pool_size);
        let available = ArrayQueue::new(pool_size);

        for i in 0..pool_size {
            let session = Session::builder()
                .map_err(|e| AppError::EmbeddingError(e.to_string()))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| AppError::EmbeddingError(e.to_string()))?
                .with_intra_threads(1)
                .map_err(|e| AppError::EmbeddingError(e.to_string()))?
                .commit_from_memory(&model_bytes)
                .map_err(|e: ort::Error| {
                    AppError::EmbeddingError(format!("Failed to load bi-encoder model: {}", e))
                })?;

            sessions.push(Mutex::new(session));
            available.push(i).map_err(|_| {
                AppError::EmbeddingError("Failed to initialize session pool".into())
            })?;
        }

        let mut model = Self {
            sessions,
            available,
            tokenizer,
            max_length,
            embedding_dim: 0,
            model_id: model_fingerprint(model_path, &model_bytes),
        };

        let probe = model.encode_batch(&["warmup".to_string()])?;
        model.embedding_dim = probe.first().map(Vec::len).unwrap_or(0);

        tracing::info!(
            model = %model_path.display(),
            tokenizer = %tokenizer_path.display(),
            max_length,
            pool_size,
            embedding_dim = model.embedding_dim,
            "Bi-encoder model loaded"
        );

        Ok(model)
    }

    fn acquire_session(&self) -> Result<SessionLease<'_>> {
        let idx = self.available.pop().ok_or_else(|| {
            AppError::ResourceError("All embedding sessions are busy".to_string())
        })?;
        Ok(SessionLease {
            pool: &self.available,
            idx,
        })
    }

    /// Encode a batch of texts into L2-normalized embedding vectors.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| AppError::EmbeddingError(format!("Tokenization failed: {}", e)))?;

        let batch_size = encodings.len();

        // Longest sequence in this batch, capped at max_length
        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(self.max_length))
            .max()
            .unwrap_or(1)
            .max(1);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];
        let token_type_ids = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let len = ids.len().min(max_len);

            for j in 0..len {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
            }
        }

        let shape = [batch_size, max_len];
        let input_ids_tensor = Tensor::from_array((shape, input_ids))
            .map_err(|e| AppError::EmbeddingError(e.to_string()))?;
        let attention_mask_tensor = Tensor::from_array((shape, attention_mask.clone()))
            .map_err(|e| AppError::EmbeddingError(e.to_string()))?;
        let token_type_ids_tensor = Tensor::from_array((shape, token_type_ids))
            .map_err(|e| AppError::EmbeddingError(e.to_string()))?;

        let lease = self.acquire_session()?;
        let mut session = self.sessions[lease.idx]
            .lock()
            .map_err(|_| AppError::EmbeddingError("Embedding session poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor,
            ])
            .map_err(|e| AppError::EmbeddingError(format!("Bi-encoder inference failed: {}", e)))?;

        // last_hidden_state: (batch, seq_len, hidden_size)
        let hidden_state = outputs.get("last_hidden_state").ok_or_else(|| {
            AppError::EmbeddingError("No 'last_hidden_state' output found".to_string())
        })?;

        let (shape_info, data) = hidden_state
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::EmbeddingError(e.to_string()))?;
        let hidden_size = shape_info[2] as usize;

        let mut embeddings = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let mut pooled = vec![0.0f32; hidden_size];
            let mut count = 0.0f32;

            for j in 0..max_len {
                if attention_mask[i * max_len + j] == 1 {
                    let base_idx = i * max_len * hidden_size + j * hidden_size;
                    for (k, sum_val) in pooled.iter_mut().enumerate() {
                        *sum_val += data[base_idx + k];
                    }
                    count += 1.0;
                }
            }

            if count > 0.0 {
                for val in pooled.iter_mut() {
                    *val /= count;
                }
            }

            let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for val in pooled.iter_mut() {
                    *val /= norm;
                }
            }

            embeddings.push(pooled);
        }

        Ok(embeddings)
    }
}

impl Embedder for BiEncoderModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| AppError::EmbeddingError("Empty bi-encoder output".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.encode_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.embedding_dim
    }

    fn identity(&self) -> String {
        format!(
            "onnx/{}/{}/{}",
            self.model_id, self.max_length, self.embedding_dim
        )
    }

    fn parallelism(&self) -> usize {
        self.sessions.len()
    }
}

/// File name plus a content digest, so a model replaced in place gets a new
/// identity.
fn model_fingerprint(model_path: &Path, model_bytes: &[u8]) -> String {
    let name = model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bi-encoder".to_string());
    let digest = Sha256::digest(model_bytes);
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{name}@{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_model_fingerprint_tracks_content_not_just_name() {
        let path = Path::new("/models/model_int8.onnx");
        let original = model_fingerprint(path, b"weights v1");
        let swapped = model_fingerprint(path, b"weights v2");

        assert!(original.starts_with("model_int8.onnx@"));
        assert_ne!(original, swapped);
        assert_eq!(original, model_fingerprint(path, b"weights v1"));
    }

    fn model_paths() -> (PathBuf, PathBuf) {
        (
            PathBuf::from(
                std::env::var("BI_ENCODER_MODEL_PATH")
                    .unwrap_or_else(|_| "./bi-encoder-model/model_int8.onnx".to_string()),
            ),
            PathBuf::from(
                std::env::var("BI_ENCODER_TOKENIZER_PATH")
                    .unwrap_or_else(|_| "./bi-encoder-model/tokenizer.json".to_string()),
            ),
        )
    }

    #[test]
    fn test_missing_tokenizer_is_embedding_error() {
        let result = BiEncoderModel::load_pool(
            Path::new("/nonexistent/model.onnx"),
            Path::new("/nonexistent/tokenizer.json"),
            128,
            1,
        );
        assert!(matches!(result, Err(AppError::EmbeddingError(_))));
    }

    #[test]
    #[ignore = "Requires bi-encoder model files"]
    fn test_embeddings_are_normalized_and_deterministic() {
        let (model, tokenizer) = model_paths();
        let encoder = BiEncoderModel::load_pool(&model, &tokenizer, 128, 2).unwrap();

        let a = encoder.embed("read a configuration file").unwrap();
        let b = encoder.embed("read a configuration file").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), encoder.dimension());

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
