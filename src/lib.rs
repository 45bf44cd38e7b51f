//! toolrelay - one front door for many stdio tool servers
//!
//! Callers describe what they want in plain language. The semantic router
//! picks the best matching (process, tool) from the catalog, and the
//! connection pool runs it on the owning child process over
//! newline-delimited JSON-RPC.

pub mod catalog;
pub mod config;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod inference;
pub mod persistence;
pub mod process;
pub mod routing;
pub mod state;

// Re-export key types for convenience
pub use catalog::{Catalog, CatalogEntry, ProcessSpec};
pub use config::Config;
pub use error::{AppError, Result};
pub use facade::{Execution, Orchestrator, OrchestratorSettings};
pub use process::{ConnectionPool, ConnectionState, ProcessConnection, ShutdownReport};
pub use routing::{Match, Router};
pub use state::AppState;

use axum::routing::{get, post};
use std::sync::Arc;

/// HTTP routes over the orchestrator. `/metrics` is added by the binary,
/// which owns the Prometheus recorder.
pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/discover", post(handlers::discover_handler))
        .route("/execute", post(handlers::execute_handler))
        .route("/capabilities", get(handlers::capabilities_handler))
        .route("/explain", post(handlers::explain_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ready", get(handlers::ready_handler))
        .with_state(state)
}
