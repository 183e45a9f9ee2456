//! PostgreSQL callback graph integration tests using testcontainers.
//!
//! Run with: cargo test --test graph_postgres --features postgres -- --nocapture
//!
//! These tests spin up PostgreSQL in a container, create the graph tables and
//! run the shared store contract plus a rehydration round trip.

mod storage;

use std::time::Duration;

use c2mesh::graph::{CallbackGraph, EdgeChange, GraphStore};
use c2mesh::storage::{PostgresGraphStore, PostgresOperationStore};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use storage::graph_store_tests::FIXTURE_SQL;

/// Start PostgreSQL container.
///
/// Returns (container, connection_string) where connection_string is suitable
/// for sqlx PgPool connection.
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "c2mesh")
        .with_env_var("POSTGRES_PASSWORD", "c2mesh")
        .with_env_var("POSTGRES_DB", "c2mesh")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    // The ready message is printed once during init and again when serving.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!("postgres://c2mesh:c2mesh@{}:{}/c2mesh", host, host_port);

    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

async fn connect_and_seed(connection_string: &str) -> (sqlx::PgPool, PostgresGraphStore) {
    let pool = sqlx::PgPool::connect(connection_string)
        .await
        .expect("Failed to connect to PostgreSQL");

    let store = PostgresGraphStore::new(pool.clone());
    store.init_schema().await.expect("init_schema should succeed");

    for statement in FIXTURE_SQL {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .expect("Failed to seed fixture");
    }

    (pool, store)
}

#[tokio::test]
async fn test_postgres_graph_store() {
    println!("=== PostgreSQL GraphStore Tests ===");

    let (_container, connection_string) = start_postgres().await;
    let (pool, store) = connect_and_seed(&connection_string).await;

    run_graph_store_tests!(&store);

    storage::graph_store_tests::test_open_operations(&PostgresOperationStore::new(pool.clone()))
        .await;
    println!("  test_open_operations: PASSED");

    store
        .init_schema()
        .await
        .expect("second init_schema should succeed");

    println!("=== All PostgreSQL GraphStore tests PASSED ===");
}

#[tokio::test]
async fn test_postgres_graph_round_trip() {
    let (_container, connection_string) = start_postgres().await;
    let (_pool, store) = connect_and_seed(&connection_string).await;
    let store = std::sync::Arc::new(store);

    let graph = CallbackGraph::new(store.clone());
    assert_eq!(graph.rehydrate().await.unwrap(), 2);
    assert_eq!(
        graph.link_by_agent_id("agent-2", "agent-3", "tcp").await,
        EdgeChange::Linked
    );

    let restarted = CallbackGraph::new(store);
    assert_eq!(restarted.rehydrate().await.unwrap(), 3);
    assert_eq!(restarted.shortest_path(1, 3).await.len(), 2);
}
