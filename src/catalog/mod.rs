//! Tool catalog: the static description of every backend process and the
//! tools it exposes.
//!
//! Loaded once at startup and shared read-only afterwards. Iteration order is
//! the order of the source document, which is what makes ranking ties and
//! capability listings deterministic.

pub mod loader;
pub mod types;

pub use types::{Catalog, CatalogEntry, ProcessSpec};
