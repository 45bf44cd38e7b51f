//! Precomputed embedding table over the catalog.

use crate::catalog::{Catalog, CatalogEntry, ProcessSpec};
use crate::error::{AppError, Result};
use crate::inference::Embedder;
use crate::persistence;
use ndarray::{Array2, ArrayView1};
use serde::Serialize;
use std::path::Path;

/// A catalog entry together with the text that was embedded for it.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    pub entry: CatalogEntry,
    pub search_text: String,
}

/// One ranked routing candidate.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Match {
    pub process_name: String,
    pub tool_name: String,
    pub description: String,
    /// Cosine similarity clamped to [0, 1]
    pub confidence: f32,
}

/// Build the text embedded for a tool: its name and description, then the
/// owning process's description, then tool keywords and process keywords.
pub fn build_search_text(process: &ProcessSpec, entry: &CatalogEntry) -> String {
    let tool_keywords = entry.keywords.join(" ");
    let process_keywords = process.keywords.join(" ");

    [
        entry.tool_name.as_str(),
        entry.description.as_str(),
        process.description.as_str(),
        tool_keywords.as_str(),
        process_keywords.as_str(),
    ]
    .iter()
    .map(|part| part.trim())
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Cosine similarity `dot(a, b) / (|a| * |b|)`, 0 when either norm is zero.
///
/// Identical non-zero vectors score exactly 1.0 so that a threshold of 1.0
/// is reachable despite rounding.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    similarity_from_parts(dot, norm_a, norm_b, || a == b)
}

fn similarity_from_parts(
    dot: f32,
    norm_a: f32,
    norm_b: f32,
    identical: impl FnOnce() -> bool,
) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let sim = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    if sim > 1.0 - 1e-5 && identical() {
        return 1.0;
    }
    sim
}

/// Embeddings for every catalog entry, row `i` belonging to `tools[i]`.
///
/// Rows follow catalog order, which is also the tie-break order when
/// ranking.
pub struct SemanticIndex {
    tools: Vec<IndexedTool>,
    embeddings: Array2<f32>,
    norms: Vec<f32>,
}

impl SemanticIndex {
    /// Embed every catalog entry. Any embedding failure is fatal: an entry
    /// without a vector cannot be routed to.
    ///
    /// With `cache_path` set, vectors are read from the cache when it matches
    /// the current catalog and embedder, and written back after a rebuild.
    pub fn build(
        catalog: &Catalog,
        embedder: &dyn Embedder,
        batch_size: usize,
        cache_path: Option<&Path>,
    ) -> Result<Self> {
        let start = std::time::Instant::now();

        let tools: Vec<IndexedTool> = catalog
            .entries()
            .map(|(process, entry)| IndexedTool {
                search_text: build_search_text(process, entry),
                entry: entry.clone(),
            })
            .collect();
        let search_texts: Vec<String> = tools.iter().map(|t| t.search_text.clone()).collect();
        let identity = embedder.identity();

        if let Some(path) = cache_path {
            match persistence::try_load_embeddings_cache(path, &search_texts, &identity) {
                Ok(Some(embeddings)) => return Self::from_parts(tools, embeddings),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable embeddings cache"),
            }
        }

        let embeddings = embed_all(embedder, &search_texts, batch_size)?;

        if let Some(path) = cache_path {
            if let Err(e) =
                persistence::save_embeddings_cache(path, &search_texts, &identity, &embeddings)
            {
                tracing::warn!(error = %e, "Failed to write embeddings cache");
            }
        }

        tracing::info!(
            tools = tools.len(),
            processes = catalog.processes().len(),
            embedding_dim = embeddings.ncols(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Semantic index built"
        );

        Self::from_parts(tools, embeddings)
    }

    /// Assemble an index from tools and a matching embedding matrix.
    pub fn from_parts(tools: Vec<IndexedTool>, embeddings: Array2<f32>) -> Result<Self> {
        if embeddings.nrows() != tools.len() {
            return Err(AppError::EmbeddingError(format!(
                "Index has {} tools but {} embeddings",
                tools.len(),
                embeddings.nrows()
            )));
        }

        let norms = embeddings
            .outer_iter()
            .map(|row| row.dot(&row).sqrt())
            .collect();

        Ok(Self {
            tools,
            embeddings,
            norms,
        })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn tools(&self) -> &[IndexedTool] {
        &self.tools
    }

    pub fn embedding(&self, idx: usize) -> Option<ArrayView1<'_, f32>> {
        (idx < self.len()).then(|| self.embeddings.row(idx))
    }

    /// Rank every entry against `query`: keep similarities `>= threshold`,
    /// order by descending similarity with ties in catalog order, truncate
    /// to `top_k`.
    pub fn rank(&self, query: &[f32], threshold: f32, top_k: usize) -> Result<Vec<Match>> {
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        if query.len() != self.dimension() {
            return Err(AppError::EmbeddingError(format!(
                "Query embedding has dimension {}, index has {}",
                query.len(),
                self.dimension()
            )));
        }

        let query_view = ArrayView1::from(query);
        let query_norm = query_view.dot(&query_view).sqrt();

        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .outer_iter()
            .enumerate()
            .map(|(idx, row)| {
                let sim = similarity_from_parts(row.dot(&query_view), self.norms[idx], query_norm, || {
                    row.iter().eq(query.iter())
                });
                (idx, sim)
            })
            .filter(|(_, sim)| *sim >= threshold)
            .collect();

        // Stable sort: equal scores keep catalog order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(idx, sim)| {
                let entry = &self.tools[idx].entry;
                Match {
                    process_name: entry.process_name.clone(),
                    tool_name: entry.tool_name.clone(),
                    description: entry.description.clone(),
                    confidence: sim.clamp(0.0, 1.0),
                }
            })
            .collect())
    }
}

fn embed_all(embedder: &dyn Embedder, texts: &[String], batch_size: usize) -> Result<Array2<f32>> {
    let mut dim = embedder.dimension();
    let mut data: Vec<f32> = Vec::with_capacity(texts.len() * dim);

    for chunk in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(chunk)?;
        if vectors.len() != chunk.len() {
            return Err(AppError::EmbeddingError(format!(
                "Embedder returned {} vectors for {} texts",
                vectors.len(),
                chunk.len()
            )));
        }

        for vector in vectors {
            if dim == 0 {
                dim = vector.len();
            }
            if vector.len() != dim {
                return Err(AppError::EmbeddingError(format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    dim,
                    vector.len()
                )));
            }
            data.extend(vector);
        }
    }

    Array2::from_shape_vec((texts.len(), dim), data)
        .map_err(|e| AppError::EmbeddingError(format!("Failed to shape embeddings: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::HashEmbedder;
    use serde_json::json;

    fn catalog() -> Catalog {
        Catalog::from_value(&json!({
            "files": {
                "command": "files-server",
                "description": "Local filesystem",
                "keywords": ["disk"],
                "tools": {
                    "read_file": { "description": "Read a file", "keywords": ["open"] },
                    "write_file": { "description": "Write a file" }
                }
            },
            "chat": {
                "command": "chat-server",
                "tools": { "send_message": { "description": "Send a chat message" } }
            }
        }))
        .unwrap()
    }

    fn tool(name: &str) -> IndexedTool {
        IndexedTool {
            entry: CatalogEntry {
                process_name: "p".into(),
                tool_name: name.into(),
                description: String::new(),
                keywords: vec![],
                parameter_schema: serde_json::Value::Null,
                examples: vec![],
            },
            search_text: name.into(),
        }
    }

    #[test]
    fn test_cosine_basic_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical_is_exactly_one() {
        let v = [0.1f32, 0.7, 0.3, 0.05, 0.9];
        assert_eq!(cosine_similarity(&v, &v), 1.0);
    }

    #[test]
    fn test_search_text_order_and_skips_empty_parts() {
        let catalog = catalog();
        let process = catalog.process("files").unwrap();
        let entry = process.tool("read_file").unwrap();
        assert_eq!(
            build_search_text(process, entry),
            "read_file Read a file Local filesystem open disk"
        );

        let chat = catalog.process("chat").unwrap();
        let send = chat.tool("send_message").unwrap();
        assert_eq!(build_search_text(chat, send), "send_message Send a chat message");
    }

    #[test]
    fn test_build_indexes_every_entry_in_order() {
        let catalog = catalog();
        let embedder = HashEmbedder::new(64).unwrap();
        let index = SemanticIndex::build(&catalog, &embedder, 2, None).unwrap();

        assert_eq!(index.len(), catalog.len());
        let names: Vec<&str> = index
            .tools()
            .iter()
            .map(|t| t.entry.tool_name.as_str())
            .collect();
        assert_eq!(names, vec!["read_file", "write_file", "send_message"]);
        assert_eq!(index.dimension(), 64);
    }

    #[test]
    fn test_rank_ties_break_by_catalog_order() {
        let tools = vec![tool("first"), tool("second"), tool("third")];
        let embeddings =
            Array2::from_shape_vec((3, 2), vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
        let index = SemanticIndex::from_parts(tools, embeddings).unwrap();

        let matches = index.rank(&[1.0, 0.0], 0.5, 10).unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.tool_name.as_str()).collect();
        assert_eq!(names, vec!["first", "third"]);
    }

    #[test]
    fn test_rank_threshold_top_k_and_ordering() {
        let tools = vec![tool("a"), tool("b"), tool("c")];
        let embeddings =
            Array2::from_shape_vec((3, 2), vec![0.6, 0.8, 1.0, 0.0, 0.8, 0.6]).unwrap();
        let index = SemanticIndex::from_parts(tools, embeddings).unwrap();

        let matches = index.rank(&[1.0, 0.0], 0.0, 2).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].tool_name, "b");
        assert_eq!(matches[1].tool_name, "c");
        assert!(matches[0].confidence >= matches[1].confidence);

        assert!(index.rank(&[1.0, 0.0], 0.0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_rank_negative_similarity_reports_zero_confidence() {
        let index =
            SemanticIndex::from_parts(vec![tool("opposite")], Array2::from_shape_vec((1, 1), vec![-1.0]).unwrap())
                .unwrap();

        assert!(index.rank(&[1.0], 0.0, 5).unwrap().is_empty());

        let matches = index.rank(&[1.0], -1.0, 5).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].confidence, 0.0);
    }

    #[test]
    fn test_rank_dimension_mismatch_is_error() {
        let index =
            SemanticIndex::from_parts(vec![tool("a")], Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).unwrap())
                .unwrap();
        assert!(matches!(
            index.rank(&[1.0, 0.0, 0.0], 0.0, 1),
            Err(AppError::EmbeddingError(_))
        ));
    }

    #[test]
    fn test_from_parts_rejects_row_mismatch() {
        let result = SemanticIndex::from_parts(vec![tool("a")], Array2::zeros((2, 4)));
        assert!(result.is_err());
    }

    #[test]
    fn test_build_uses_cache_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("embeddings.bin");
        let catalog = catalog();
        let embedder = HashEmbedder::new(32).unwrap();

        let first = SemanticIndex::build(&catalog, &embedder, 8, Some(&cache)).unwrap();
        assert!(cache.exists());

        let second = SemanticIndex::build(&catalog, &embedder, 8, Some(&cache)).unwrap();
        assert_eq!(first.embeddings, second.embeddings);
    }
}
