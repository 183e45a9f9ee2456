//! PostgreSQL implementation of OperationStore.

use async_trait::async_trait;
use sea_query::{Expr, Order, PostgresQueryBuilder, Query};
use sqlx::{PgPool, Row};

use crate::notify::{OperationRecord, OperationStore};
use crate::storage::schema::Operations;
use crate::storage::Result;

/// PostgreSQL-backed operation lookups.
pub struct PostgresOperationStore {
    pool: PgPool,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
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
            .to_string(PostgresQueryBuilder);

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
