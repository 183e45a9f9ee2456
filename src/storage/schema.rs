//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! The tables belong to the platform's relational store; `init_schema` only
//! creates them when missing.

use sea_query::Iden;

/// Callback (agent instance) table.
#[derive(Iden)]
#[iden = "callback"]
pub enum Callbacks {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "agent_callback_id"]
    AgentCallbackId,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "display_id"]
    DisplayId,
}

/// Transport profile table.
#[derive(Iden)]
#[iden = "c2profile"]
pub enum C2Profiles {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
}

/// Operation table.
#[derive(Iden)]
#[iden = "operation"]
pub enum Operations {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "complete"]
    Complete,
    #[iden = "deleted"]
    Deleted,
    #[iden = "webhook"]
    Webhook,
    #[iden = "channel"]
    Channel,
}

/// P2P link table.
#[derive(Iden)]
#[iden = "callbackgraphedge"]
pub enum CallbackGraphEdges {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "source_id"]
    SourceId,
    #[iden = "destination_id"]
    DestinationId,
    #[iden = "c2_profile_id"]
    C2ProfileId,
    #[iden = "start_timestamp"]
    StartTimestamp,
    #[iden = "end_timestamp"]
    EndTimestamp,
}

/// Edge rows joined with both endpoints and the profile name. Rows tagged
/// with an unresolved profile carry an empty name.
///
/// Callers append their own `WHERE` clause.
pub const SELECT_EDGE_ROWS: &str = r#"
SELECT e.id AS id,
       e.operation_id AS operation_id,
       e.source_id AS source_id,
       s.agent_callback_id AS source_agent_id,
       e.destination_id AS destination_id,
       d.agent_callback_id AS destination_agent_id,
       e.c2_profile_id AS c2_profile_id,
       COALESCE(p.name, '') AS c2_profile_name,
       (e.end_timestamp IS NULL) AS active
FROM callbackgraphedge e
JOIN callback s ON s.id = e.source_id
JOIN callback d ON d.id = e.destination_id
LEFT JOIN c2profile p ON p.id = e.c2_profile_id
"#;

/// Name of the index enforcing one active row per directed triple.
pub const ACTIVE_EDGE_INDEX: &str = "idx_callbackgraphedge_active";
