//! PostgreSQL implementations of storage interfaces.

mod graph_store;
mod operation_store;

pub use graph_store::PostgresGraphStore;
pub use operation_store::PostgresOperationStore;
