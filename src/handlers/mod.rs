pub mod catalog;
pub mod discover;
pub mod execute;
pub mod health;

pub use catalog::{capabilities_handler, explain_handler};
pub use discover::discover_handler;
pub use execute::execute_handler;
pub use health::{health_handler, ready_handler};
