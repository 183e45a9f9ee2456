//! Storage implementations.
//!
//! SQLite and PostgreSQL backends for the callback graph and the operation
//! lookups used at startup, plus in-memory mocks for testing.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::{StorageConfig, StorageType};
use crate::graph::GraphStore;
use crate::notify::OperationStore;

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::{MockGraphStore, MockOperationStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresGraphStore, PostgresOperationStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteGraphStore, SqliteOperationStore};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Store handles opened from configuration.
#[derive(Clone)]
pub struct Stores {
    pub graph: Arc<dyn GraphStore>,
    pub operations: Arc<dyn OperationStore>,
}

/// Initialize storage based on configuration.
///
/// Opens the configured database and makes sure the graph tables exist.
pub async fn init_storage(config: &StorageConfig) -> std::result::Result<Stores, Box<dyn std::error::Error>> {
    info!(storage_type = %config.storage_type, "Opening storage");

    match &config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path)).await?;

            let graph = Arc::new(SqliteGraphStore::new(pool.clone()));
            graph.init_schema().await?;

            Ok(Stores {
                graph,
                operations: Arc::new(SqliteOperationStore::new(pool)),
            })
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            let pool = sqlx::PgPool::connect(&config.postgres.uri).await?;

            let graph = Arc::new(PostgresGraphStore::new(pool.clone()));
            graph.init_schema().await?;

            Ok(Stores {
                graph,
                operations: Arc::new(PostgresOperationStore::new(pool)),
            })
        }
        #[allow(unreachable_patterns)]
        other => {
            error!(storage_type = %other, "Storage type requested but its feature is not enabled");
            Err(format!("{} feature not enabled", other).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteConfig;

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_init_storage_opens_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            storage_type: StorageType::Sqlite,
            sqlite: SqliteConfig {
                path: dir.path().join("data/c2mesh.db").to_string_lossy().into_owned(),
            },
            ..Default::default()
        };

        let stores = init_storage(&config).await.unwrap();
        assert!(stores.graph.active_edges().await.unwrap().is_empty());
        assert!(stores.operations.open_operations().await.unwrap().is_empty());
        assert_eq!(config.storage_type, StorageType::Sqlite);
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_init_storage_rejects_disabled_backend() {
        let config = StorageConfig {
            storage_type: StorageType::Postgres,
            sqlite: SqliteConfig::default(),
            ..Default::default()
        };

        let err = init_storage(&config).await.err().unwrap();
        assert_eq!(err.to_string(), "postgres feature not enabled");
    }
}
