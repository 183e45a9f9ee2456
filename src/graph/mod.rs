//! Callback graph: the live P2P topology between agents.
//!
//! Links are undirected but held as two directed adjacency entries so every
//! node's list names all its neighbors. The in-memory graph mirrors the active
//! rows of the persisted edge table; every mutation persists first and then
//! updates memory while holding the graph lock, so concurrent handlers can
//! link and unlink overlapping pairs without lost updates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

mod path;
pub mod store;


pub use store::{Callback, EdgeRow, GraphStore, NewEdge, StoreError};

/// Profile id used when a profile name cannot be resolved.
pub const UNKNOWN_PROFILE_ID: i64 = 0;

/// Result type for administrative graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors from administrative graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("callback not found: {0}")]
    CallbackNotFound(String),

    #[error("edge {edge_id} not found in operation {operation_id}")]
    EdgeNotFound { edge_id: i64, operation_id: i64 },
}

/// One directed adjacency entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub source_id: i64,
    pub destination_id: i64,
    pub source_agent_id: String,
    pub destination_agent_id: String,
    pub c2_profile_name: String,
}

impl GraphEdge {
    fn reversed(&self) -> Self {
        Self {
            source_id: self.destination_id,
            destination_id: self.source_id,
            source_agent_id: self.destination_agent_id.clone(),
            destination_agent_id: self.source_agent_id.clone(),
            c2_profile_name: self.c2_profile_name.clone(),
        }
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} --{}--> {}",
            self.source_id, self.c2_profile_name, self.destination_id
        )
    }
}

/// Outcome of a link or unlink request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeChange {
    /// A new active edge was persisted and added to memory.
    Linked,
    /// An active edge already existed; memory holds it.
    AlreadyLinked,
    /// Active edges were closed and removed from memory.
    Unlinked,
    /// No active edge matched; nothing changed.
    NotLinked,
    /// The agent id is not known to the store.
    UnknownCallback(String),
    /// The store failed; memory may differ from storage until the next
    /// rehydrate.
    StorageFailed(String),
}

/// Node identity cached per agent id.
#[derive(Debug, Clone, Copy)]
struct Node {
    id: i64,
    operation_id: i64,
}

#[derive(Default)]
struct GraphState {
    adjacency: BTreeMap<i64, Vec<GraphEdge>>,
    profile_ids: HashMap<String, i64>,
    nodes: HashMap<String, Node>,
}

impl GraphState {
    fn add_directed(&mut self, edge: GraphEdge) {
        let entries = self.adjacency.entry(edge.source_id).or_default();
        let exists = entries.iter().any(|e| {
            e.destination_id == edge.destination_id && e.c2_profile_name == edge.c2_profile_name
        });
        if !exists {
            entries.push(edge);
        }
    }

    fn remove_directed(&mut self, source_id: i64, destination_id: i64, profile: &str) {
        let Some(entries) = self.adjacency.get_mut(&source_id) else {
            return;
        };
        if let Some(pos) = entries
            .iter()
            .position(|e| e.destination_id == destination_id && e.c2_profile_name == profile)
        {
            entries.remove(pos);
        }
        if entries.is_empty() {
            self.adjacency.remove(&source_id);
        }
    }

    fn add_link(&mut self, edge: GraphEdge) {
        self.add_directed(edge.reversed());
        self.add_directed(edge);
    }

    /// Remove both directions of a closed link.
    ///
    /// Storage tags every unresolved profile with the same sentinel id, so
    /// closing a sentinel row drops every unresolved-profile entry between the
    /// pair, whatever name it was linked under.
    fn remove_link(&mut self, source_id: i64, destination_id: i64, profile: &str, profile_id: i64) {
        if profile_id != UNKNOWN_PROFILE_ID {
            self.remove_directed(source_id, destination_id, profile);
            self.remove_directed(destination_id, source_id, profile);
            return;
        }

        let unresolved: Vec<String> = [(source_id, destination_id), (destination_id, source_id)]
            .iter()
            .filter_map(|(from, to)| {
                self.adjacency
                    .get(from)
                    .map(|entries| entries.iter().filter(move |e| e.destination_id == *to))
            })
            .flatten()
            .filter(|e| !self.profile_ids.contains_key(&e.c2_profile_name))
            .map(|e| e.c2_profile_name.clone())
            .collect();

        for name in unresolved {
            self.remove_directed(source_id, destination_id, &name);
            self.remove_directed(destination_id, source_id, &name);
        }
    }
}

/// Undirected P2P topology between callbacks, backed by a `GraphStore`.
pub struct CallbackGraph {
    store: Arc<dyn GraphStore>,
    state: Mutex<GraphState>,
}

impl CallbackGraph {
    /// Create an empty graph. Call `rehydrate` before anything else.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            state: Mutex::new(GraphState::default()),
        }
    }

    /// Rebuild the adjacency map from the active rows in storage.
    ///
    /// Returns the number of active rows loaded. On a storage error the
    /// in-memory graph is left untouched.
    pub async fn rehydrate(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let rows = self.store.active_edges().await?;

        state.adjacency.clear();
        for row in &rows {
            state.nodes.insert(
                row.source_agent_id.clone(),
                Node {
                    id: row.source_id,
                    operation_id: row.operation_id,
                },
            );
            state.nodes.insert(
                row.destination_agent_id.clone(),
                Node {
                    id: row.destination_id,
                    operation_id: row.operation_id,
                },
            );
            if row.c2_profile_id != UNKNOWN_PROFILE_ID {
                state
                    .profile_ids
                    .insert(row.c2_profile_name.clone(), row.c2_profile_id);
            }
            state.add_link(GraphEdge {
                source_id: row.source_id,
                destination_id: row.destination_id,
                source_agent_id: row.source_agent_id.clone(),
                destination_agent_id: row.destination_agent_id.clone(),
                c2_profile_name: row.c2_profile_name.clone(),
            });
        }

        info!(edges = rows.len(), "Callback graph rehydrated");
        Ok(rows.len())
    }

    // ------------------------------------------------------------------
    // Agent-facing entry points. These never fail; lookup and storage
    // problems are logged and reported through `EdgeChange`.
    // ------------------------------------------------------------------

    /// Record a P2P link reported by an agent.
    pub async fn link_by_agent_id(
        &self,
        source_agent_id: &str,
        destination_agent_id: &str,
        c2_profile_name: &str,
    ) -> EdgeChange {
        let (source, destination) = match self
            .resolve_pair(source_agent_id, destination_agent_id)
            .await
        {
            Ok(pair) => pair,
            Err(change) => return change,
        };

        let edge = GraphEdge {
            source_id: source.id,
            destination_id: destination.id,
            source_agent_id: source_agent_id.to_string(),
            destination_agent_id: destination_agent_id.to_string(),
            c2_profile_name: c2_profile_name.to_string(),
        };
        let row = NewEdge {
            operation_id: source.operation_id,
            source_id: source.id,
            destination_id: destination.id,
            c2_profile_id: self.profile_id(c2_profile_name).await,
        };

        let mut state = self.state.lock().await;
        let persisted = self.store.insert_edge(&row).await;
        state.add_link(edge);

        match persisted {
            Ok(true) => {
                debug!(source = source.id, destination = destination.id, profile = %c2_profile_name, "Linked callbacks");
                EdgeChange::Linked
            }
            Ok(false) => EdgeChange::AlreadyLinked,
            Err(e) => {
                error!(
                    source = source.id,
                    destination = destination.id,
                    profile = %c2_profile_name,
                    error = %e,
                    "Failed to persist callback edge"
                );
                EdgeChange::StorageFailed(e.to_string())
            }
        }
    }

    /// Remove a P2P link reported by an agent.
    pub async fn unlink_by_agent_id(
        &self,
        source_agent_id: &str,
        destination_agent_id: &str,
        c2_profile_name: &str,
    ) -> EdgeChange {
        let (source, destination) = match self
            .resolve_pair(source_agent_id, destination_agent_id)
            .await
        {
            Ok(pair) => pair,
            Err(change) => return change,
        };

        let row = NewEdge {
            operation_id: source.operation_id,
            source_id: source.id,
            destination_id: destination.id,
            c2_profile_id: self.profile_id(c2_profile_name).await,
        };

        let mut state = self.state.lock().await;
        match self.store.close_edges(&row).await {
            Ok(0) => EdgeChange::NotLinked,
            Ok(closed) => {
                state.remove_link(source.id, destination.id, c2_profile_name, row.c2_profile_id);
                debug!(source = source.id, destination = destination.id, closed, "Unlinked callbacks");
                EdgeChange::Unlinked
            }
            Err(e) => {
                error!(
                    source = source.id,
                    destination = destination.id,
                    profile = %c2_profile_name,
                    error = %e,
                    "Failed to close callback edge"
                );
                EdgeChange::StorageFailed(e.to_string())
            }
        }
    }

    // ------------------------------------------------------------------
    // Operator-facing entry points.
    // ------------------------------------------------------------------

    /// Link two callbacks by internal id.
    pub async fn link_by_id(
        &self,
        source_id: i64,
        destination_id: i64,
        c2_profile_name: &str,
    ) -> Result<EdgeChange> {
        let source = self.callback_by_id(source_id).await?;
        let destination = self.callback_by_id(destination_id).await?;
        self.link_callbacks(&source, &destination, c2_profile_name)
            .await
    }

    /// Link two callbacks by their operator-visible display ids.
    pub async fn link_by_display_id(
        &self,
        source_display_id: i64,
        destination_display_id: i64,
        c2_profile_name: &str,
        operation_id: i64,
    ) -> Result<EdgeChange> {
        let source = self
            .callback_by_display_id(source_display_id, operation_id)
            .await?;
        let destination = self
            .callback_by_display_id(destination_display_id, operation_id)
            .await?;
        self.link_callbacks(&source, &destination, c2_profile_name)
            .await
    }

    /// Unlink two callbacks by internal id.
    pub async fn unlink_by_id(
        &self,
        source_id: i64,
        destination_id: i64,
        c2_profile_name: &str,
    ) -> Result<EdgeChange> {
        let source = self.callback_by_id(source_id).await?;
        let destination = self.callback_by_id(destination_id).await?;

        let row = NewEdge {
            operation_id: source.operation_id,
            source_id: source.id,
            destination_id: destination.id,
            c2_profile_id: self.profile_id(c2_profile_name).await,
        };
        let edge = GraphEdge {
            source_id: source.id,
            destination_id: destination.id,
            source_agent_id: source.agent_callback_id,
            destination_agent_id: destination.agent_callback_id,
            c2_profile_name: c2_profile_name.to_string(),
        };
        self.close_and_remove(&row, &edge).await
    }

    /// Close a persisted edge by id. Edges of other operations are not found.
    pub async fn unlink_by_edge_id(&self, edge_id: i64, operation_id: i64) -> Result<EdgeChange> {
        let row = self
            .store
            .find_edge(edge_id, operation_id)
            .await?
            .ok_or(GraphError::EdgeNotFound {
                edge_id,
                operation_id,
            })?;

        if !row.active {
            return Ok(EdgeChange::NotLinked);
        }

        let key = NewEdge {
            operation_id: row.operation_id,
            source_id: row.source_id,
            destination_id: row.destination_id,
            c2_profile_id: row.c2_profile_id,
        };
        let edge = GraphEdge {
            source_id: row.source_id,
            destination_id: row.destination_id,
            source_agent_id: row.source_agent_id,
            destination_agent_id: row.destination_agent_id,
            c2_profile_name: row.c2_profile_name,
        };
        self.close_and_remove(&key, &edge).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the node has at least one live neighbor.
    pub async fn can_reach_delegates(&self, node_id: i64) -> bool {
        self.state
            .lock()
            .await
            .adjacency
            .get(&node_id)
            .is_some_and(|edges| !edges.is_empty())
    }

    /// Fewest-hop route between two callbacks, in travel order. Empty when
    /// the two are the same node or not connected.
    pub async fn shortest_path(&self, source_id: i64, destination_id: i64) -> Vec<GraphEdge> {
        let state = self.state.lock().await;
        path::shortest_path(&state.adjacency, source_id, destination_id)
    }

    /// Every directed adjacency entry, grouped by source id.
    pub async fn edges(&self) -> Vec<GraphEdge> {
        self.state
            .lock()
            .await
            .adjacency
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// One line per directed entry.
    pub async fn render(&self) -> String {
        self.edges()
            .await
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn link_callbacks(
        &self,
        source: &Callback,
        destination: &Callback,
        c2_profile_name: &str,
    ) -> Result<EdgeChange> {
        let row = NewEdge {
            operation_id: source.operation_id,
            source_id: source.id,
            destination_id: destination.id,
            c2_profile_id: self.profile_id(c2_profile_name).await,
        };

        let mut state = self.state.lock().await;
        let inserted = self.store.insert_edge(&row).await?;
        state.add_link(GraphEdge {
            source_id: source.id,
            destination_id: destination.id,
            source_agent_id: source.agent_callback_id.clone(),
            destination_agent_id: destination.agent_callback_id.clone(),
            c2_profile_name: c2_profile_name.to_string(),
        });

        Ok(if inserted {
            EdgeChange::Linked
        } else {
            EdgeChange::AlreadyLinked
        })
    }

    async fn close_and_remove(&self, row: &NewEdge, edge: &GraphEdge) -> Result<EdgeChange> {
        let mut state = self.state.lock().await;
        let closed = self.store.close_edges(row).await?;
        if closed == 0 {
            return Ok(EdgeChange::NotLinked);
        }
        state.remove_link(
            edge.source_id,
            edge.destination_id,
            &edge.c2_profile_name,
            row.c2_profile_id,
        );
        Ok(EdgeChange::Unlinked)
    }

    async fn resolve_pair(
        &self,
        source_agent_id: &str,
        destination_agent_id: &str,
    ) -> std::result::Result<(Node, Node), EdgeChange> {
        let source = self.resolve_agent(source_agent_id).await?;
        let destination = self.resolve_agent(destination_agent_id).await?;
        Ok((source, destination))
    }

    async fn resolve_agent(&self, agent_callback_id: &str) -> std::result::Result<Node, EdgeChange> {
        if let Some(node) = self.state.lock().await.nodes.get(agent_callback_id) {
            return Ok(*node);
        }

        match self.store.find_callback_by_agent_id(agent_callback_id).await {
            Ok(Some(callback)) => {
                let node = Node {
                    id: callback.id,
                    operation_id: callback.operation_id,
                };
                self.state
                    .lock()
                    .await
                    .nodes
                    .insert(agent_callback_id.to_string(), node);
                Ok(node)
            }
            Ok(None) => {
                warn!(agent_callback_id = %agent_callback_id, "Unknown callback in P2P event");
                Err(EdgeChange::UnknownCallback(agent_callback_id.to_string()))
            }
            Err(e) => {
                warn!(agent_callback_id = %agent_callback_id, error = %e, "Failed to look up callback");
                Err(EdgeChange::StorageFailed(e.to_string()))
            }
        }
    }

    async fn callback_by_id(&self, id: i64) -> Result<Callback> {
        self.store
            .find_callback_by_id(id)
            .await?
            .ok_or_else(|| GraphError::CallbackNotFound(id.to_string()))
    }

    async fn callback_by_display_id(&self, display_id: i64, operation_id: i64) -> Result<Callback> {
        self.store
            .find_callback_by_display_id(display_id, operation_id)
            .await?
            .ok_or_else(|| {
                GraphError::CallbackNotFound(format!(
                    "display id {} in operation {}",
                    display_id, operation_id
                ))
            })
    }

    /// Cached profile id, or `UNKNOWN_PROFILE_ID` if the name cannot be
    /// resolved. Misses are not cached.
    async fn profile_id(&self, name: &str) -> i64 {
        if let Some(id) = self.state.lock().await.profile_ids.get(name) {
            return *id;
        }

        match self.store.find_profile_id(name).await {
            Ok(Some(id)) => {
                self.state
                    .lock()
                    .await
                    .profile_ids
                    .insert(name.to_string(), id);
                id
            }
            Ok(None) => {
                warn!(profile = %name, "Unknown C2 profile");
                UNKNOWN_PROFILE_ID
            }
            Err(e) => {
                warn!(profile = %name, error = %e, "Failed to look up C2 profile");
                UNKNOWN_PROFILE_ID
            }
        }
    }
}
