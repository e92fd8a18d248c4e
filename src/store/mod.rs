//! Persistence layer: libSQL-backed storage for forwarding rules and
//! system stats.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use traits::{SystemStatsRecord, TaskStore};
