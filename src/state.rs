use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::Result;
use crate::facade::{Orchestrator, OrchestratorSettings};
use crate::inference;
use crate::process::ConnectionPool;
use crate::routing::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Application state shared across all request handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Set once the catalog is indexed; cleared when shutdown begins.
    pub ready: AtomicBool,
    pub config: Arc<Config>,
}

impl AppState {
    /// Load the catalog, index it and wire up the orchestrator.
    ///
    /// Blocking and fatal on error: the service must not answer requests
    /// with a partial index.
    pub fn new(config: Config) -> Result<Self> {
        let catalog = Arc::new(Catalog::from_path(&config.catalog_path)?);

        let embedder = inference::from_config(&config)?;
        tracing::info!(
            embedder = %embedder.identity(),
            dimension = embedder.dimension(),
            "Embedder ready"
        );

        let router = Router::build(
            Arc::clone(&catalog),
            embedder,
            config.batch_size,
            config.embeddings_cache_path.as_deref(),
        )?;
        tracing::info!(indexed = router.index().len(), "Router ready");

        let pool = ConnectionPool::new(Arc::clone(&catalog), config.terminate_grace);
        let settings = OrchestratorSettings {
            execute_threshold: config.execute_threshold,
            call_timeout: config.call_timeout,
            validate_arguments: config.validate_arguments,
        };
        let orchestrator = Orchestrator::new(catalog, Arc::new(router), Arc::new(pool), settings);

        Ok(Self::from_parts(orchestrator, config))
    }

    /// Wrap an already built orchestrator. The state starts out ready.
    pub fn from_parts(orchestrator: Orchestrator, config: Config) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            ready: AtomicBool::new(true),
            config: Arc::new(config),
        }
    }

    /// Check if the service is ready to handle requests.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}
