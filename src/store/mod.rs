//! Persistence layer: libSQL-backed storage for alert state and run history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AlertStore, RunRecord, RunSummary, SeenKey, StateWrite, SurgeSample};
