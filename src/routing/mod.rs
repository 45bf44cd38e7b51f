//! Semantic routing: map free text to ranked (process, tool) candidates.
//!
//! The [`SemanticIndex`] holds one embedding per catalog entry, computed once
//! at startup. The [`Router`] embeds a query and ranks the index against it
//! by cosine similarity.

pub mod index;
pub mod router;

pub use index::{cosine_similarity, IndexedTool, Match, SemanticIndex};
pub use router::{Capabilities, Router};
