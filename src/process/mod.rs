//! Backend process management.
//!
//! Each backend tool server is a child process spoken to over
//! newline-delimited JSON on its stdin/stdout:
//! - [`protocol`]: request/response envelopes and their line encoding
//! - [`connection`]: one child process, its lifecycle and serialized calls
//! - [`pool`]: lazily created connections keyed by process name

pub mod connection;
pub mod pool;
pub mod protocol;

pub use connection::{ConnectionState, ProcessConnection};
pub use pool::{ConnectionPool, ShutdownReport};
