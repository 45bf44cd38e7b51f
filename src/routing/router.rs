//! Query-time routing over the semantic index.

use crate::catalog::Catalog;
use crate::error::{AppError, Result};
use crate::inference::Embedder;
use crate::routing::index::{Match, SemanticIndex};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// How long a query waits for an embedding slot before giving up.
const EMBED_PERMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tool summaries grouped by process, in catalog order.
///
/// Serializes as a JSON object whose key order is the catalog order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities(Vec<(String, Vec<String>)>);

impl Capabilities {
    pub fn get(&self, process_name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(name, _)| name == process_name)
            .map(|(_, tools)| tools.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(name, tools)| (name.as_str(), tools.as_slice()))
    }

    pub fn process_names(&self) -> Vec<&str> {
        self.0.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, tools) in &self.0 {
            map.serialize_entry(name, tools)?;
        }
        map.end()
    }
}

/// Embeds queries and ranks them against the catalog index.
///
/// Read-only after construction; share it behind an `Arc`.
pub struct Router {
    catalog: Arc<Catalog>,
    index: Arc<SemanticIndex>,
    embedder: Arc<dyn Embedder>,
    /// Bounds concurrent query embeddings to what the embedder can serve.
    permits: Arc<Semaphore>,
}

impl Router {
    pub fn new(catalog: Arc<Catalog>, index: SemanticIndex, embedder: Arc<dyn Embedder>) -> Self {
        let permits = Arc::new(Semaphore::new(embedder.parallelism().max(1)));
        Self {
            catalog,
            index: Arc::new(index),
            embedder,
            permits,
        }
    }

    /// Index the whole catalog and return a ready router. Blocking; run it
    /// once at startup before serving.
    pub fn build(
        catalog: Arc<Catalog>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        cache_path: Option<&Path>,
    ) -> Result<Self> {
        let index = SemanticIndex::build(&catalog, embedder.as_ref(), batch_size, cache_path)?;
        Ok(Self::new(catalog, index, embedder))
    }

    pub fn index(&self) -> &SemanticIndex {
        &self.index
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Rank catalog entries against `text`.
    ///
    /// The embedding runs on a blocking worker. Dropping the returned future
    /// (for example under `tokio::time::timeout`) abandons the query, but its
    /// embedding slot stays taken until the worker finishes.
    pub async fn query(&self, text: &str, threshold: f32, top_k: usize) -> Result<Vec<Match>> {
        if top_k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let permit = tokio::time::timeout(EMBED_PERMIT_TIMEOUT, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                AppError::ResourceError("Embedding capacity exhausted, please retry".to_string())
            })?
            .map_err(|_| AppError::ResourceError("Semaphore closed".to_string()))?;

        let embedder = Arc::clone(&self.embedder);
        let index = Arc::clone(&self.index);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let query = embedder.embed(&text)?;
            index.rank(&query, threshold, top_k)
        })
        .await
        .map_err(|e| AppError::EmbeddingError(format!("Query task join error: {}", e)))?
    }

    /// Synchronous form of [`Router::query`] for callers outside a runtime.
    pub fn query_blocking(&self, text: &str, threshold: f32, top_k: usize) -> Result<Vec<Match>> {
        if top_k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text)?;
        self.index.rank(&query, threshold, top_k)
    }

    /// `"tool: description"` lines per process, optionally restricted to
    /// processes that declare `category`. Processes without tools are left
    /// out.
    pub fn list_capabilities(&self, category: Option<&str>) -> Capabilities {
        let groups = self
            .catalog
            .processes()
            .iter()
            .filter(|p| category.map_or(true, |c| p.has_category(c)))
            .filter(|p| !p.tools.is_empty())
            .map(|p| {
                let summaries = p
                    .tools
                    .iter()
                    .map(|t| {
                        let desc = if t.description.is_empty() {
                            "No description"
                        } else {
                            t.description.as_str()
                        };
                        format!("{}: {}", t.tool_name, desc)
                    })
                    .collect();
                (p.name.clone(), summaries)
            })
            .collect();

        Capabilities(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::HashEmbedder;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// One session, slow to embed, and an error instead of a wait when it
    /// is already in use.
    struct SingleSessionEmbedder {
        inner: HashEmbedder,
        busy: AtomicBool,
    }

    impl Embedder for SingleSessionEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.busy.swap(true, Ordering::SeqCst) {
                return Err(AppError::ResourceError("All embedding sessions are busy".to_string()));
            }
            std::thread::sleep(Duration::from_millis(300));
            let vector = self.inner.embed(text);
            self.busy.store(false, Ordering::SeqCst);
            vector
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn identity(&self) -> String {
            "single-session".to_string()
        }
    }

    fn router(doc: serde_json::Value) -> Router {
        let catalog = Arc::new(Catalog::from_value(&doc).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256).unwrap());
        Router::build(catalog, embedder, 16, None).unwrap()
    }

    fn sample() -> serde_json::Value {
        json!({
            "mcps": {
                "files": {
                    "command": "files-server",
                    "categories": ["files"],
                    "tools": {
                        "read_file": { "description": "Read the contents of a file" },
                        "delete_file": {}
                    }
                },
                "images": {
                    "command": "image-server",
                    "categories": ["image"],
                    "tools": { "resize_image": { "description": "Resize an image" } }
                },
                "idle": { "command": "idle-server" }
            }
        })
    }

    #[tokio::test]
    async fn test_exact_search_text_matches_at_threshold_one() {
        let router = router(sample());
        let matches = router
            .query("read_file Read the contents of a file", 1.0, 5)
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].process_name, "files");
        assert_eq!(matches[0].tool_name, "read_file");
        assert_eq!(matches[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_matches_are_from_catalog_and_descending() {
        let router = router(sample());
        let matches = router.query("resize a file image", 0.0, 10).await.unwrap();

        assert!(!matches.is_empty());
        for m in &matches {
            assert!(router.catalog().entry(&m.process_name, &m.tool_name).is_some());
            assert!(m.confidence >= 0.0);
        }
        for pair in matches.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[tokio::test]
    async fn test_abandoned_query_holds_its_slot_until_embedding_finishes() {
        let catalog = Arc::new(Catalog::from_value(&sample()).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(SingleSessionEmbedder {
            inner: HashEmbedder::new(64).unwrap(),
            busy: AtomicBool::new(false),
        });
        let index = SemanticIndex::build(&catalog, embedder.as_ref(), 16, None).unwrap();
        let router = Router::new(catalog, index, embedder);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), router.query("read a file", 0.0, 3)).await;
        assert!(abandoned.is_err());

        // Waits for the abandoned embedding rather than colliding with it
        let matches = router.query("resize an image", 0.0, 3).await.unwrap();
        assert!(!matches.is_empty());
    }

    #[tokio::test]
    async fn test_zero_top_k_returns_nothing() {
        let router = router(sample());
        assert!(router.query("read a file", 0.0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_catalog_has_no_matches() {
        let router = router(json!({}));
        assert!(router.index().is_empty());
        assert!(router.query("anything", 0.0, 10).await.unwrap().is_empty());
        assert!(router.list_capabilities(None).is_empty());
    }

    #[test]
    fn test_query_blocking_agrees_with_async() {
        let router = router(sample());
        let sync = router.query_blocking("resize an image", 0.1, 3).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let async_result = rt.block_on(router.query("resize an image", 0.1, 3)).unwrap();
        assert_eq!(sync, async_result);
    }

    #[test]
    fn test_list_capabilities_order_and_filter() {
        let router = router(sample());

        let all = router.list_capabilities(None);
        assert_eq!(all.process_names(), vec!["files", "images"]);
        assert_eq!(
            all.get("files").unwrap(),
            &[
                "read_file: Read the contents of a file".to_string(),
                "delete_file: No description".to_string()
            ]
        );

        let images = router.list_capabilities(Some("image"));
        assert_eq!(images.process_names(), vec!["images"]);

        assert!(router.list_capabilities(Some("audio")).is_empty());
    }

    #[test]
    fn test_capabilities_serialize_in_catalog_order() {
        let router = router(sample());
        let json = serde_json::to_string(&router.list_capabilities(None)).unwrap();
        let files_at = json.find("\"files\"").unwrap();
        let images_at = json.find("\"images\"").unwrap();
        assert!(files_at < images_at);
    }
}
