//! SQLite implementation of OperationStore.

use async_trait::async_trait;
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::notify::{OperationRecord, OperationStore};
use crate::storage::schema::Operations;
use crate::storage::Result;

/// SQLite-backed operation lookups.
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn open_operations(&self) -> Result<Vec<OperationRecord>> {
        let query = Query::select()
            .columns([
                Operations::Id,
                Operations::Name,
                Operations::Webhook,
                Operations::Channel,
            ])
            .from(Operations::Table)
            .and_where(Expr::col(Operations::Complete).eq(false))
            .and_where(Expr::col(Operations::Deleted).eq(false))
            .order_by(Operations::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|r| OperationRecord {
                id: r.get("id"),
                name: r.get("name"),
                webhook: r.get("webhook"),
                channel: r.get("channel"),
            })
            .collect())
    }
}
