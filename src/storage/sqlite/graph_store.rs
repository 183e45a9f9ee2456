//! SQLite implementation of GraphStore.

use async_trait::async_trait;
use sea_query::{Cond, Expr, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::graph::store::{Callback, EdgeRow, GraphStore, NewEdge, Result};
use crate::storage::schema::{
    C2Profiles, CallbackGraphEdges, Callbacks, ACTIVE_EDGE_INDEX, SELECT_EDGE_ROWS,
};

/// SQLite-backed callback graph store.
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Create a new SQLite graph store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_callback(&self, query: String) -> Result<Option<Callback>> {
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| Callback {
            id: r.get("id"),
            agent_callback_id: r.get("agent_callback_id"),
            operation_id: r.get("operation_id"),
            display_id: r.get("display_id"),
        }))
    }
}

fn callback_query(cond: Cond) -> String {
    Query::select()
        .columns([
            Callbacks::Id,
            Callbacks::AgentCallbackId,
            Callbacks::OperationId,
            Callbacks::DisplayId,
        ])
        .from(Callbacks::Table)
        .cond_where(cond)
        .limit(1)
        .to_string(SqliteQueryBuilder)
}

fn edge_row(r: &SqliteRow) -> EdgeRow {
    EdgeRow {
        id: r.get("id"),
        operation_id: r.get("operation_id"),
        source_id: r.get("source_id"),
        source_agent_id: r.get("source_agent_id"),
        destination_id: r.get("destination_id"),
        destination_agent_id: r.get("destination_agent_id"),
        c2_profile_id: r.get("c2_profile_id"),
        c2_profile_name: r.get("c2_profile_name"),
        active: r.get("active"),
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS operation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                complete INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                webhook TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS callback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_callback_id TEXT NOT NULL UNIQUE,
                operation_id INTEGER NOT NULL,
                display_id INTEGER NOT NULL,
                UNIQUE (operation_id, display_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS c2profile (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS callbackgraphedge (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL REFERENCES callback(id),
                destination_id INTEGER NOT NULL REFERENCES callback(id),
                c2_profile_id INTEGER NOT NULL,
                start_timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                end_timestamp TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON callbackgraphedge
                (operation_id, source_id, destination_id, c2_profile_id)
             WHERE end_timestamp IS NULL",
            ACTIVE_EDGE_INDEX
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_edges(&self) -> Result<Vec<EdgeRow>> {
        let query = format!("{} WHERE e.end_timestamp IS NULL ORDER BY e.id", SELECT_EDGE_ROWS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(edge_row).collect())
    }

    async fn find_callback_by_agent_id(&self, agent_callback_id: &str) -> Result<Option<Callback>> {
        let query = callback_query(
            Cond::all().add(Expr::col(Callbacks::AgentCallbackId).eq(agent_callback_id)),
        );
        self.fetch_callback(query).await
    }

    async fn find_callback_by_id(&self, id: i64) -> Result<Option<Callback>> {
        let query = callback_query(Cond::all().add(Expr::col(Callbacks::Id).eq(id)));
        self.fetch_callback(query).await
    }

    async fn find_callback_by_display_id(
        &self,
        display_id: i64,
        operation_id: i64,
    ) -> Result<Option<Callback>> {
        let query = callback_query(
            Cond::all()
                .add(Expr::col(Callbacks::DisplayId).eq(display_id))
                .add(Expr::col(Callbacks::OperationId).eq(operation_id)),
        );
        self.fetch_callback(query).await
    }

    async fn find_profile_id(&self, name: &str) -> Result<Option<i64>> {
        let query = Query::select()
            .column(C2Profiles::Id)
            .from(C2Profiles::Table)
            .and_where(Expr::col(C2Profiles::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool> {
        // Single statement: the existence check and the insert cannot interleave
        // with another writer.
        let result = sqlx::query(
            "INSERT INTO callbackgraphedge (operation_id, source_id, destination_id, c2_profile_id)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (
                 SELECT 1 FROM callbackgraphedge
                 WHERE operation_id = ?1
                   AND c2_profile_id = ?4
                   AND end_timestamp IS NULL
                   AND ((source_id = ?2 AND destination_id = ?3)
                     OR (source_id = ?3 AND destination_id = ?2))
             )
             ON CONFLICT DO NOTHING",
        )
        .bind(edge.operation_id)
        .bind(edge.source_id)
        .bind(edge.destination_id)
        .bind(edge.c2_profile_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn close_edges(&self, edge: &NewEdge) -> Result<u64> {
        let forward = Cond::all()
            .add(Expr::col(CallbackGraphEdges::SourceId).eq(edge.source_id))
            .add(Expr::col(CallbackGraphEdges::DestinationId).eq(edge.destination_id));
        let reverse = Cond::all()
            .add(Expr::col(CallbackGraphEdges::SourceId).eq(edge.destination_id))
            .add(Expr::col(CallbackGraphEdges::DestinationId).eq(edge.source_id));

        let query = Query::update()
            .table(CallbackGraphEdges::Table)
            .value(CallbackGraphEdges::EndTimestamp, Expr::current_timestamp())
            .cond_where(
                Cond::all()
                    .add(Expr::col(CallbackGraphEdges::OperationId).eq(edge.operation_id))
                    .add(Expr::col(CallbackGraphEdges::C2ProfileId).eq(edge.c2_profile_id))
                    .add(Expr::col(CallbackGraphEdges::EndTimestamp).is_null())
                    .add(Cond::any().add(forward).add(reverse)),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn find_edge(&self, edge_id: i64, operation_id: i64) -> Result<Option<EdgeRow>> {
        let query = format!("{} WHERE e.id = ?1 AND e.operation_id = ?2", SELECT_EDGE_ROWS);
        let row = sqlx::query(&query)
            .bind(edge_id)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(edge_row))
    }
}
