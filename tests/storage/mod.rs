//! Shared storage integration tests.
//!
//! Tests the GraphStore and OperationStore interfaces against every SQL
//! backend. Each backend module seeds `FIXTURE_SQL` into a fresh database and
//! runs `run_graph_store_tests!`.

pub mod graph_store_tests;
