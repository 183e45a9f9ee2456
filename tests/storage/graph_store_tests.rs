//! GraphStore interface tests.
//!
//! These tests verify the contract of the GraphStore and OperationStore
//! traits. They assume a fresh schema seeded with `FIXTURE_SQL`, so the three
//! fixture edges get ids 1, 2 and 3.

use c2mesh::graph::{GraphStore, NewEdge};
use c2mesh::notify::OperationStore;

pub const OP_ALPHA: i64 = 1;
pub const OP_BRAVO: i64 = 2;
pub const SMB: i64 = 7;
pub const TCP: i64 = 8;

/// Active edge 1 -- smb -- 2 in operation alpha.
pub const EDGE_ACTIVE: i64 = 1;
/// Closed edge 2 -- tcp -- 3 in operation alpha.
pub const EDGE_CLOSED: i64 = 2;
/// Active edge 4 -- smb -- 5 in operation bravo.
pub const EDGE_BRAVO: i64 = 3;

/// Portable seed statements for SQLite and PostgreSQL.
pub const FIXTURE_SQL: &[&str] = &[
    "INSERT INTO operation (id, name, complete, deleted, webhook, channel) VALUES
        (1, 'alpha', FALSE, FALSE, 'https://hooks.example/alpha', '#alpha'),
        (2, 'bravo', FALSE, FALSE, 'https://hooks.example/bravo', '#bravo'),
        (3, 'charlie', TRUE, FALSE, '', ''),
        (4, 'delta', FALSE, TRUE, '', '')",
    "INSERT INTO callback (id, agent_callback_id, operation_id, display_id) VALUES
        (1, 'agent-1', 1, 1),
        (2, 'agent-2', 1, 2),
        (3, 'agent-3', 1, 3),
        (4, 'agent-4', 2, 1),
        (5, 'agent-5', 2, 2),
        (6, 'agent-6', 1, 4)",
    "INSERT INTO c2profile (id, name) VALUES (7, 'smb'), (8, 'tcp')",
    "INSERT INTO callbackgraphedge (operation_id, source_id, destination_id, c2_profile_id)
        VALUES (1, 1, 2, 7)",
    "INSERT INTO callbackgraphedge (operation_id, source_id, destination_id, c2_profile_id, end_timestamp)
        VALUES (1, 2, 3, 8, CURRENT_TIMESTAMP)",
    "INSERT INTO callbackgraphedge (operation_id, source_id, destination_id, c2_profile_id)
        VALUES (2, 4, 5, 7)",
];

fn edge(operation_id: i64, source_id: i64, destination_id: i64, c2_profile_id: i64) -> NewEdge {
    NewEdge {
        operation_id,
        source_id,
        destination_id,
        c2_profile_id,
    }
}

// =============================================================================
// Read tests
// =============================================================================

pub async fn test_active_edges_skip_closed<S: GraphStore>(store: &S) {
    let rows = store.active_edges().await.expect("active_edges should succeed");

    assert!(rows.iter().all(|r| r.active), "only active rows expected");
    assert!(
        rows.iter().all(|r| r.id != EDGE_CLOSED),
        "closed edge must not be loaded"
    );

    let alpha = rows
        .iter()
        .find(|r| r.id == EDGE_ACTIVE)
        .expect("active alpha edge should be loaded");
    assert_eq!(alpha.operation_id, OP_ALPHA);
    assert_eq!(alpha.source_agent_id, "agent-1");
    assert_eq!(alpha.destination_agent_id, "agent-2");
    assert_eq!(alpha.c2_profile_id, SMB);
    assert_eq!(alpha.c2_profile_name, "smb");

    assert!(rows.iter().any(|r| r.id == EDGE_BRAVO));
}

pub async fn test_find_callbacks<S: GraphStore>(store: &S) {
    let by_agent = store
        .find_callback_by_agent_id("agent-3")
        .await
        .expect("lookup should succeed")
        .expect("agent-3 should exist");
    assert_eq!(by_agent.id, 3);
    assert_eq!(by_agent.operation_id, OP_ALPHA);

    let by_id = store
        .find_callback_by_id(5)
        .await
        .expect("lookup should succeed")
        .expect("callback 5 should exist");
    assert_eq!(by_id.agent_callback_id, "agent-5");

    // Display ids are per operation.
    let display = store
        .find_callback_by_display_id(1, OP_BRAVO)
        .await
        .expect("lookup should succeed")
        .expect("display 1 in bravo should exist");
    assert_eq!(display.id, 4);
    assert_eq!(display.display_id, 1);

    assert!(store
        .find_callback_by_agent_id("agent-404")
        .await
        .expect("lookup should succeed")
        .is_none());
    assert!(store
        .find_callback_by_display_id(9, OP_ALPHA)
        .await
        .expect("lookup should succeed")
        .is_none());
}

pub async fn test_find_profile_id<S: GraphStore>(store: &S) {
    assert_eq!(store.find_profile_id("smb").await.unwrap(), Some(SMB));
    assert_eq!(store.find_profile_id("tcp").await.unwrap(), Some(TCP));
    assert_eq!(store.find_profile_id("dns").await.unwrap(), None);
}

pub async fn test_find_edge_is_operation_scoped<S: GraphStore>(store: &S) {
    let row = store
        .find_edge(EDGE_ACTIVE, OP_ALPHA)
        .await
        .expect("find_edge should succeed")
        .expect("edge should be found in its operation");
    assert!(row.active);
    assert_eq!(row.source_id, 1);

    assert!(store
        .find_edge(EDGE_ACTIVE, OP_BRAVO)
        .await
        .expect("find_edge should succeed")
        .is_none());

    let closed = store
        .find_edge(EDGE_CLOSED, OP_ALPHA)
        .await
        .expect("find_edge should succeed")
        .expect("closed edges stay queryable");
    assert!(!closed.active);
    assert_eq!(closed.c2_profile_name, "tcp");
}

// =============================================================================
// Write tests
// =============================================================================

pub async fn test_insert_edge_is_unique_per_pair<S: GraphStore>(store: &S) {
    assert!(store.insert_edge(&edge(OP_ALPHA, 1, 3, SMB)).await.unwrap());
    assert!(
        !store.insert_edge(&edge(OP_ALPHA, 1, 3, SMB)).await.unwrap(),
        "duplicate insert must be a no-op"
    );
    assert!(
        !store.insert_edge(&edge(OP_ALPHA, 3, 1, SMB)).await.unwrap(),
        "reverse direction is the same link"
    );
    assert!(
        store.insert_edge(&edge(OP_ALPHA, 1, 3, TCP)).await.unwrap(),
        "another profile is another link"
    );

    let rows = store.active_edges().await.unwrap();
    let between = rows
        .iter()
        .filter(|r| {
            (r.source_id, r.destination_id) == (1, 3) || (r.source_id, r.destination_id) == (3, 1)
        })
        .count();
    assert_eq!(between, 2);
}

pub async fn test_close_edges_matches_both_directions<S: GraphStore>(store: &S) {
    assert!(store.insert_edge(&edge(OP_ALPHA, 3, 6, SMB)).await.unwrap());

    assert_eq!(store.close_edges(&edge(OP_ALPHA, 6, 3, SMB)).await.unwrap(), 1);
    assert_eq!(
        store.close_edges(&edge(OP_ALPHA, 6, 3, SMB)).await.unwrap(),
        0,
        "closing twice is a no-op"
    );

    // History is kept; relinking writes a fresh row.
    assert!(store.insert_edge(&edge(OP_ALPHA, 3, 6, SMB)).await.unwrap());
    assert_eq!(store.close_edges(&edge(OP_ALPHA, 3, 6, SMB)).await.unwrap(), 1);
}

pub async fn test_close_edges_respects_operation<S: GraphStore>(store: &S) {
    assert_eq!(
        store.close_edges(&edge(OP_ALPHA, 4, 5, SMB)).await.unwrap(),
        0,
        "bravo edge must not be closed through alpha"
    );
    assert!(store.find_edge(EDGE_BRAVO, OP_BRAVO).await.unwrap().unwrap().active);
}

// =============================================================================
// OperationStore tests
// =============================================================================

pub async fn test_open_operations<S: OperationStore>(store: &S) {
    let ops = store
        .open_operations()
        .await
        .expect("open_operations should succeed");

    let names: Vec<_> = ops.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "bravo"]);
    assert_eq!(ops[0].id, OP_ALPHA);
    assert_eq!(ops[0].webhook, "https://hooks.example/alpha");
    assert_eq!(ops[1].channel, "#bravo");
}

/// Run all GraphStore tests against a freshly seeded store.
#[macro_export]
macro_rules! run_graph_store_tests {
    ($store:expr) => {
        use $crate::storage::graph_store_tests::*;

        // reads first: they rely on the untouched fixture
        test_active_edges_skip_closed($store).await;
        println!("  test_active_edges_skip_closed: PASSED");

        test_find_callbacks($store).await;
        println!("  test_find_callbacks: PASSED");

        test_find_profile_id($store).await;
        println!("  test_find_profile_id: PASSED");

        test_find_edge_is_operation_scoped($store).await;
        println!("  test_find_edge_is_operation_scoped: PASSED");

        // writes
        test_insert_edge_is_unique_per_pair($store).await;
        println!("  test_insert_edge_is_unique_per_pair: PASSED");

        test_close_edges_matches_both_directions($store).await;
        println!("  test_close_edges_matches_both_directions: PASSED");

        test_close_edges_respects_operation($store).await;
        println!("  test_close_edges_respects_operation: PASSED");
    };
}
