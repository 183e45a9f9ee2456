//! Mock storage implementations for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Result, StoreError};
use crate::graph::store::{Callback, EdgeRow, GraphStore, NewEdge};
use crate::notify::{OperationRecord, OperationStore};

struct StoredEdge {
    id: i64,
    edge: NewEdge,
    active: bool,
}

impl StoredEdge {
    fn joins(&self, edge: &NewEdge) -> bool {
        self.edge.operation_id == edge.operation_id
            && self.edge.c2_profile_id == edge.c2_profile_id
            && ((self.edge.source_id == edge.source_id
                && self.edge.destination_id == edge.destination_id)
                || (self.edge.source_id == edge.destination_id
                    && self.edge.destination_id == edge.source_id))
    }
}

#[derive(Default)]
struct Tables {
    callbacks: Vec<Callback>,
    profiles: Vec<(i64, String)>,
    edges: Vec<StoredEdge>,
}

impl Tables {
    fn callback(&self, id: i64) -> Option<&Callback> {
        self.callbacks.iter().find(|c| c.id == id)
    }

    fn row(&self, stored: &StoredEdge) -> Option<EdgeRow> {
        let source = self.callback(stored.edge.source_id)?;
        let destination = self.callback(stored.edge.destination_id)?;
        let profile = self
            .profiles
            .iter()
            .find(|(id, _)| *id == stored.edge.c2_profile_id)
            .map(|(_, name)| name.clone())
            .unwrap_or_default();

        Some(EdgeRow {
            id: stored.id,
            operation_id: stored.edge.operation_id,
            source_id: source.id,
            source_agent_id: source.agent_callback_id.clone(),
            destination_id: destination.id,
            destination_agent_id: destination.agent_callback_id.clone(),
            c2_profile_id: stored.edge.c2_profile_id,
            c2_profile_name: profile,
            active: stored.active,
        })
    }
}

/// Mock graph store that keeps its tables in memory.
#[derive(Default)]
pub struct MockGraphStore {
    tables: RwLock<Tables>,
    fail_on_write: AtomicBool,
    fail_on_read: AtomicBool,
    callback_lookups: AtomicUsize,
    profile_lookups: AtomicUsize,
}

impl MockGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_callback(&self, id: i64, agent_callback_id: &str, operation_id: i64, display_id: i64) {
        self.tables.write().await.callbacks.push(Callback {
            id,
            agent_callback_id: agent_callback_id.to_string(),
            operation_id,
            display_id,
        });
    }

    pub async fn add_profile(&self, id: i64, name: &str) {
        self.tables.write().await.profiles.push((id, name.to_string()));
    }

    /// Write an edge row directly, bypassing the uniqueness check.
    pub async fn seed_edge(&self, edge: NewEdge, active: bool) -> i64 {
        let mut tables = self.tables.write().await;
        let id = tables.edges.len() as i64 + 1;
        tables.edges.push(StoredEdge { id, edge, active });
        id
    }

    /// Close an edge row directly, as an administrative action would.
    pub async fn close_edge_row(&self, edge_id: i64) {
        if let Some(stored) = self.tables.write().await.edges.iter_mut().find(|e| e.id == edge_id) {
            stored.active = false;
        }
    }

    pub fn set_fail_on_write(&self, fail: bool) {
        self.fail_on_write.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_read(&self, fail: bool) {
        self.fail_on_read.store(fail, Ordering::SeqCst);
    }

    /// Active edge rows, in insertion order.
    pub async fn active_rows(&self) -> Vec<NewEdge> {
        self.tables
            .read()
            .await
            .edges
            .iter()
            .filter(|e| e.active)
            .map(|e| e.edge)
            .collect()
    }

    /// Callback lookups served so far, by any key.
    pub fn callback_lookups(&self) -> usize {
        self.callback_lookups.load(Ordering::SeqCst)
    }

    pub fn profile_lookups(&self) -> usize {
        self.profile_lookups.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_on_read.load(Ordering::SeqCst) {
            return Err(StoreError::Database("mock read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_on_write.load(Ordering::SeqCst) {
            return Err(StoreError::Database("mock write failure".to_string()));
        }
        Ok(())
    }

    async fn find_callback<F>(&self, predicate: F) -> Result<Option<Callback>>
    where
        F: Fn(&Callback) -> bool,
    {
        self.check_read()?;
        self.callback_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .await
            .callbacks
            .iter()
            .find(|c| predicate(c))
            .cloned())
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn active_edges(&self) -> Result<Vec<EdgeRow>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .filter(|e| e.active)
            .filter_map(|e| tables.row(e))
            .collect())
    }

    async fn find_callback_by_agent_id(&self, agent_callback_id: &str) -> Result<Option<Callback>> {
        self.find_callback(|c| c.agent_callback_id == agent_callback_id)
            .await
    }

    async fn find_callback_by_id(&self, id: i64) -> Result<Option<Callback>> {
        self.find_callback(|c| c.id == id).await
    }

    async fn find_callback_by_display_id(
        &self,
        display_id: i64,
        operation_id: i64,
    ) -> Result<Option<Callback>> {
        self.find_callback(|c| c.display_id == display_id && c.operation_id == operation_id)
            .await
    }

    async fn find_profile_id(&self, name: &str) -> Result<Option<i64>> {
        self.check_read()?;
        self.profile_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .read()
            .await
            .profiles
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id))
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if tables.edges.iter().any(|e| e.active && e.joins(edge)) {
            return Ok(false);
        }
        let id = tables.edges.len() as i64 + 1;
        tables.edges.push(StoredEdge {
            id,
            edge: *edge,
            active: true,
        });
        Ok(true)
    }

    async fn close_edges(&self, edge: &NewEdge) -> Result<u64> {
        self.check_write()?;
        let mut closed = 0;
        for stored in self.tables.write().await.edges.iter_mut() {
            if stored.active && stored.joins(edge) {
                stored.active = false;
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn find_edge(&self, edge_id: i64, operation_id: i64) -> Result<Option<EdgeRow>> {
        self.check_read()?;
        let tables = self.tables.read().await;
        Ok(tables
            .edges
            .iter()
            .find(|e| e.id == edge_id && e.edge.operation_id == operation_id)
            .and_then(|e| tables.row(e)))
    }
}

/// Mock operation store with a fixed operation list.
#[derive(Default)]
pub struct MockOperationStore {
    operations: RwLock<Vec<OperationRecord>>,
    fail_on_read: AtomicBool,
}

impl MockOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_operation(&self, operation: OperationRecord) {
        self.operations.write().await.push(operation);
    }

    pub fn set_fail_on_read(&self, fail: bool) {
        self.fail_on_read.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OperationStore for MockOperationStore {
    async fn open_operations(&self) -> Result<Vec<OperationRecord>> {
        if self.fail_on_read.load(Ordering::SeqCst) {
            return Err(StoreError::Database("mock read failure".to_string()));
        }
        Ok(self.operations.read().await.clone())
    }
}
