//! On-disk cache of catalog embeddings.
//!
//! Indexing the catalog is the one slow startup step. When the catalog and the
//! embedder are unchanged since the last run, the vectors are read back from
//! disk instead of being recomputed. The cache is keyed by a SHA-256 over the
//! embedder identity and every search text in catalog order, each
//! length-prefixed, so any change to either invalidates it.

use crate::error::{AppError, Result};
use ndarray::Array2;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Cache file format version. Increment when format changes.
const CACHE_VERSION: u32 = 2;

/// Magic bytes to identify valid cache files.
const CACHE_MAGIC: &[u8; 8] = b"TLRELAY\0";

const HEADER_LEN: usize = 8 + 4 + 32 + 8 + 8;

fn cache_io(context: &'static str) -> impl Fn(std::io::Error) -> AppError {
    move |e| AppError::EmbeddingError(format!("Embedding cache: {}: {}", context, e))
}

/// Cached embeddings with metadata for validation.
pub struct EmbeddingsCache {
    /// SHA-256 of embedder identity + search texts
    pub key: [u8; 32],
    pub num_tools: usize,
    pub embedding_dim: usize,
    /// One row per indexed tool, catalog order
    pub embeddings: Array2<f32>,
}

impl EmbeddingsCache {
    pub fn compute_key(search_texts: &[String], embedder_identity: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();

        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(embedder_identity.as_bytes());
        for text in search_texts {
            field(text.as_bytes());
        }

        hasher.finalize().into()
    }

    pub fn new(search_texts: &[String], embedder_identity: &str, embeddings: Array2<f32>) -> Self {
        Self {
            key: Self::compute_key(search_texts, embedder_identity),
            num_tools: embeddings.nrows(),
            embedding_dim: embeddings.ncols(),
            embeddings,
        }
    }

    /// Write the cache as:
    /// magic (8) | version u32 LE | key (32) | num_tools u64 LE |
    /// embedding_dim u64 LE | f32 LE data, row-major.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(cache_io("create directory"))?;
        }

        let file = File::create(path).map_err(cache_io("create file"))?;
        let mut writer = BufWriter::new(file);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(CACHE_MAGIC);
        header.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        header.extend_from_slice(&self.key);
        header.extend_from_slice(&(self.num_tools as u64).to_le_bytes());
        header.extend_from_slice(&(self.embedding_dim as u64).to_le_bytes());
        writer.write_all(&header).map_err(cache_io("write header"))?;

        for &val in self.embeddings.iter() {
            writer
                .write_all(&val.to_le_bytes())
                .map_err(cache_io("write data"))?;
        }

        writer.flush().map_err(cache_io("flush"))?;

        tracing::info!(
            path = %path.display(),
            num_tools = self.num_tools,
            embedding_dim = self.embedding_dim,
            size_bytes = HEADER_LEN + self.num_tools * self.embedding_dim * 4,
            "Embeddings cache saved"
        );

        Ok(())
    }

    /// Read a cache file. `Ok(None)` when it is missing or not ours.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Cache file does not exist");
            return Ok(None);
        }

        let file = File::open(path).map_err(cache_io("open file"))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN];
        if reader.read_exact(&mut header).is_err() || &header[..8] != CACHE_MAGIC {
            tracing::warn!(path = %path.display(), "Invalid cache header, ignoring");
            return Ok(None);
        }

        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != CACHE_VERSION {
            tracing::warn!(
                path = %path.display(),
                cache_version = version,
                expected_version = CACHE_VERSION,
                "Cache version mismatch, ignoring"
            );
            return Ok(None);
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&header[12..44]);

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[44..52]);
        let num_tools = u64::from_le_bytes(word) as usize;
        word.copy_from_slice(&header[52..60]);
        let embedding_dim = u64::from_le_bytes(word) as usize;

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).map_err(cache_io("read data"))?;

        let expected = num_tools.checked_mul(embedding_dim).and_then(|n| n.checked_mul(4));
        if expected != Some(raw.len()) {
            tracing::warn!(
                path = %path.display(),
                num_tools,
                embedding_dim,
                data_bytes = raw.len(),
                "Cache data length mismatch, ignoring"
            );
            return Ok(None);
        }

        let data: Vec<f32> = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let embeddings = Array2::from_shape_vec((num_tools, embedding_dim), data).map_err(|e| {
            AppError::EmbeddingError(format!("Embedding cache: reshape: {}", e))
        })?;

        tracing::info!(
            path = %path.display(),
            num_tools,
            embedding_dim,
            "Embeddings cache loaded"
        );

        Ok(Some(Self {
            key,
            num_tools,
            embedding_dim,
            embeddings,
        }))
    }

    pub fn is_valid_for(&self, search_texts: &[String], embedder_identity: &str) -> bool {
        self.num_tools == search_texts.len()
            && self.key == Self::compute_key(search_texts, embedder_identity)
    }
}

/// Try to load embeddings from cache, validating against the current catalog
/// and embedder. `Ok(None)` on any miss.
pub fn try_load_embeddings_cache(
    cache_path: &Path,
    search_texts: &[String],
    embedder_identity: &str,
) -> Result<Option<Array2<f32>>> {
    match EmbeddingsCache::load(cache_path)? {
        Some(cache) if cache.is_valid_for(search_texts, embedder_identity) => {
            tracing::info!("Using cached embeddings (cache hit)");
            Ok(Some(cache.embeddings))
        }
        Some(_) => {
            tracing::info!("Cache invalid (catalog or embedder changed), will recompute");
            Ok(None)
        }
        None => {
            tracing::info!("No cache found, will compute embeddings");
            Ok(None)
        }
    }
}

pub fn save_embeddings_cache(
    cache_path: &Path,
    search_texts: &[String],
    embedder_identity: &str,
    embeddings: &Array2<f32>,
) -> Result<()> {
    EmbeddingsCache::new(search_texts, embedder_identity, embeddings.clone()).save(cache_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_changes_with_texts_and_identity() {
        let a = texts(&["read_file Read a file"]);
        let b = texts(&["write_file Write a file"]);

        assert_ne!(
            EmbeddingsCache::compute_key(&a, "hash/64"),
            EmbeddingsCache::compute_key(&b, "hash/64")
        );
        assert_ne!(
            EmbeddingsCache::compute_key(&a, "hash/64"),
            EmbeddingsCache::compute_key(&a, "hash/128")
        );
    }

    #[test]
    fn test_key_distinguishes_embedded_newlines() {
        let joined = texts(&["read_file\nRead a file"]);
        let split = texts(&["read_file", "Read a file"]);
        assert_ne!(
            EmbeddingsCache::compute_key(&joined, "hash/64"),
            EmbeddingsCache::compute_key(&split, "hash/64")
        );

        // Identity and first text must not bleed into each other either
        assert_ne!(
            EmbeddingsCache::compute_key(&texts(&["b"]), "a"),
            EmbeddingsCache::compute_key(&texts(&["ab"]), "")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("nested").join("embeddings.bin");

        let search_texts = texts(&["tool1 desc1", "tool2 desc2"]);
        let embeddings =
            Array2::from_shape_vec((2, 4), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();

        save_embeddings_cache(&cache_path, &search_texts, "hash/4", &embeddings).unwrap();

        let loaded = EmbeddingsCache::load(&cache_path).unwrap().unwrap();
        assert_eq!(loaded.num_tools, 2);
        assert_eq!(loaded.embedding_dim, 4);
        assert_eq!(loaded.embeddings, embeddings);
        assert!(loaded.is_valid_for(&search_texts, "hash/4"));

        let hit = try_load_embeddings_cache(&cache_path, &search_texts, "hash/4").unwrap();
        assert_eq!(hit, Some(embeddings));
    }

    #[test]
    fn test_cache_invalidation() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("embeddings.bin");

        let before = texts(&["tool1 desc1"]);
        let after = texts(&["tool1 a different description"]);
        let embeddings = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();

        save_embeddings_cache(&cache_path, &before, "hash/4", &embeddings).unwrap();

        let miss = try_load_embeddings_cache(&cache_path, &after, "hash/4").unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_garbage_file_is_ignored() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("embeddings.bin");
        fs::write(&cache_path, b"definitely not a cache").unwrap();

        assert!(EmbeddingsCache::load(&cache_path).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_ignored() {
        let dir = tempdir().unwrap();
        let cache_path = dir.path().join("embeddings.bin");
        let search_texts = texts(&["a", "b"]);
        let embeddings = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        save_embeddings_cache(&cache_path, &search_texts, "hash/2", &embeddings).unwrap();

        let mut bytes = fs::read(&cache_path).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&cache_path, bytes).unwrap();

        assert!(EmbeddingsCache::load(&cache_path).unwrap().is_none());
    }
}
