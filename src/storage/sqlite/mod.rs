//! SQLite implementations of storage interfaces.

mod graph_store;
mod operation_store;

pub use graph_store::SqliteGraphStore;
pub use operation_store::SqliteOperationStore;
