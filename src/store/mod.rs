//! Persistence layer: libSQL-backed task queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{StoredResult, TaskStore};
