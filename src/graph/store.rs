//! GraphStore trait and record types.
//!
//! Pluggable backing store for the callback graph. Implementations exist for
//! SQLite and PostgreSQL, feature-gated on their respective storage backends,
//! plus an in-memory mock for tests.

use async_trait::async_trait;

pub use crate::storage::{Result, StoreError};

/// A remote agent instance as known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    pub id: i64,
    /// Agent-visible UUID.
    pub agent_callback_id: String,
    pub operation_id: i64,
    /// Operator-visible number, unique within an operation.
    pub display_id: i64,
}

/// A persisted P2P link, joined with its endpoint and profile metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    pub id: i64,
    pub operation_id: i64,
    pub source_id: i64,
    pub source_agent_id: String,
    pub destination_id: i64,
    pub destination_agent_id: String,
    pub c2_profile_id: i64,
    pub c2_profile_name: String,
    /// `end_timestamp IS NULL`.
    pub active: bool,
}

/// Values for a new edge row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEdge {
    pub operation_id: i64,
    pub source_id: i64,
    pub destination_id: i64,
    pub c2_profile_id: i64,
}

/// Backing store for callback graph edges and the lookups the graph needs.
///
/// One active row exists per unordered `{source, destination}` pair, profile
/// and operation. Rows are never deleted; closing sets `end_timestamp`.
#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// Create tables and indexes if they don't exist.
    async fn init_schema(&self) -> Result<()>;

    /// Every active edge, joined with agent ids and profile names.
    async fn active_edges(&self) -> Result<Vec<EdgeRow>>;

    async fn find_callback_by_agent_id(&self, agent_callback_id: &str) -> Result<Option<Callback>>;

    async fn find_callback_by_id(&self, id: i64) -> Result<Option<Callback>>;

    async fn find_callback_by_display_id(
        &self,
        display_id: i64,
        operation_id: i64,
    ) -> Result<Option<Callback>>;

    async fn find_profile_id(&self, name: &str) -> Result<Option<i64>>;

    /// Insert an active edge unless one already exists in either direction.
    ///
    /// Returns whether a row was written.
    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool>;

    /// Close every active edge between the two callbacks, in either
    /// direction, for the given profile. Returns the number of rows closed.
    async fn close_edges(&self, edge: &NewEdge) -> Result<u64>;

    /// Look up one edge by id, scoped to an operation. Closed edges are
    /// returned with `active == false`.
    async fn find_edge(&self, edge_id: i64, operation_id: i64) -> Result<Option<EdgeRow>>;
}
