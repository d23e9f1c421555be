//! OperationLedger implementation for SQLite
//!
//! The ledger is append-only. Status moves forward only
//! (`pending -> in_progress -> completed | failed`), and the schema's
//! triggers reject any update of a terminal row or any delete.

use async_trait::async_trait;
use kindred_core::operation::{payload_with, PAYLOAD_ROLLBACK_KEY};
use kindred_core::{
    EngineConfig, EntityOperation, GraphError, GraphResult, HistoryQuery, NewOperation,
    OperationLedger, OperationStatus, RecordRef, RollbackData,
};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::SqliteResult;
use crate::ids::{allocate_identity, resolve_ref, Table};
use crate::queries::{fetch_operation, query_all, require_collection, require_operation};
use crate::rows::{now, opt_ts, row_to_operation, ts, OPERATION_COLUMNS};

/// Append an operation with the given initial status
///
/// Terminal statuses get `completed_at` immediately, for operations that are
/// recorded after the fact (links, drift, forced unlocks).
pub(crate) fn insert_operation(
    conn: &Connection,
    op: &NewOperation,
    status: OperationStatus,
    attempts: u32,
) -> SqliteResult<EntityOperation> {
    if op.performed_by.trim().is_empty() {
        return Err(GraphError::validation("performed_by must not be blank").into());
    }
    let payload = op.payload()?;
    require_collection(conn, op.collection_uuid)?;

    let identity = allocate_identity(conn, Table::EntityOperations, attempts)?;
    let performed_at = now();
    let completed_at = status.is_terminal().then_some(performed_at);
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM entity_operations",
        [],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO entity_operations
             (uuid, display_id, seq, collection_uuid, operation_type, entity_ids, description,
              payload, performed_by, status, performed_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            seq,
            op.collection_uuid.to_string(),
            op.operation_type.as_str(),
            serde_json::to_string(&op.entity_ids)?,
            op.description,
            payload.to_string(),
            op.performed_by,
            status.as_str(),
            ts(&performed_at),
            opt_ts(&completed_at),
        ],
    )?;

    debug!(
        operation = %identity.display_id,
        operation_type = %op.operation_type,
        %status,
        seq,
        "Recorded operation"
    );
    require_operation(conn, identity.uuid)
}

/// Move an operation forward, merging `keys` into its payload
pub(crate) fn transition_operation(
    conn: &Connection,
    operation: Uuid,
    next: OperationStatus,
    keys: &[(&str, Value)],
) -> SqliteResult<EntityOperation> {
    let current = require_operation(conn, operation)?;
    current.status.check_transition(next, &current.display_id)?;

    let mut payload = current.payload.clone();
    for (key, value) in keys {
        payload = payload_with(&payload, key, value.clone());
    }
    let completed_at = next.is_terminal().then(now);

    let updated = conn.execute(
        "UPDATE entity_operations SET status = ?2, payload = ?3, completed_at = ?4
         WHERE uuid = ?1 AND status = ?5",
        params![
            operation.to_string(),
            next.as_str(),
            payload.to_string(),
            opt_ts(&completed_at),
            current.status.as_str(),
        ],
    )?;
    if updated == 0 {
        return Err(GraphError::conflict(format!(
            "operation {} changed status concurrently",
            current.display_id
        ))
        .into());
    }
    require_operation(conn, operation)
}

pub(crate) fn fail_operation(
    conn: &Connection,
    operation: Uuid,
    error: &str,
    extra: &[(&str, Value)],
) -> SqliteResult<EntityOperation> {
    let mut keys = vec![(kindred_core::operation::PAYLOAD_ERROR_KEY, Value::from(error))];
    keys.extend(extra.iter().cloned());
    transition_operation(conn, operation, OperationStatus::Failed, &keys)
}

/// Attach rollback data to an open merge, split or unmerge
pub(crate) fn store_rollback(
    conn: &Connection,
    operation: Uuid,
    data: &RollbackData,
) -> SqliteResult<EntityOperation> {
    let current = require_operation(conn, operation)?;
    if !current.operation_type.supports_rollback() {
        return Err(GraphError::validation(format!(
            "{} operations carry no rollback data",
            current.operation_type
        ))
        .into());
    }
    if current.status.is_terminal() {
        return Err(GraphError::validation(format!(
            "operation {} is already {}",
            current.display_id, current.status
        ))
        .into());
    }

    let payload = payload_with(&current.payload, PAYLOAD_ROLLBACK_KEY, serde_json::to_value(data)?);
    conn.execute(
        "UPDATE entity_operations SET payload = ?2 WHERE uuid = ?1",
        params![operation.to_string(), payload.to_string()],
    )?;
    require_operation(conn, operation)
}

pub(crate) fn history(
    conn: &Connection,
    query: &HistoryQuery,
    default_limit: usize,
) -> SqliteResult<Vec<EntityOperation>> {
    require_collection(conn, query.collection_uuid)?;
    let limit = i64::try_from(query.limit.unwrap_or(default_limit)).unwrap_or(i64::MAX);
    let sql = format!(
        "SELECT {} FROM entity_operations
         WHERE collection_uuid = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY performed_at DESC, seq DESC
         LIMIT ?3",
        OPERATION_COLUMNS
    );
    // Newest N, returned in commit order
    let mut operations = query_all(
        conn,
        &sql,
        params![
            query.collection_uuid.to_string(),
            query.status.map(|s| s.as_str()),
            limit
        ],
        row_to_operation,
    )?;
    operations.reverse();
    Ok(operations)
}

/// SQLite implementation of OperationLedger
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl OperationLedger for SqliteLedger {
    async fn record(&self, operation: NewOperation) -> GraphResult<EntityOperation> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| {
                    insert_operation(tx, &operation, OperationStatus::Pending, attempts)
                })
            })
            .await
    }

    async fn mark_in_progress(&self, operation: Uuid) -> GraphResult<EntityOperation> {
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| {
                    transition_operation(tx, operation, OperationStatus::InProgress, &[])
                })
            })
            .await
    }

    async fn mark_completed(&self, operation: Uuid) -> GraphResult<EntityOperation> {
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| {
                    transition_operation(tx, operation, OperationStatus::Completed, &[])
                })
            })
            .await
    }

    async fn mark_failed(&self, operation: Uuid, error: &str) -> GraphResult<EntityOperation> {
        let error = error.to_string();
        self.pool
            .run(move |pool| pool.with_transaction(|tx| fail_operation(tx, operation, &error, &[])))
            .await
    }

    async fn set_rollback_data(
        &self,
        operation: Uuid,
        data: &RollbackData,
    ) -> GraphResult<EntityOperation> {
        let data = data.clone();
        self.pool
            .run(move |pool| pool.with_transaction(|tx| store_rollback(tx, operation, &data)))
            .await
    }

    async fn get_operation(&self, id: &RecordRef) -> GraphResult<Option<EntityOperation>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    match resolve_ref(conn, Table::EntityOperations, &id)? {
                        Some(uuid) => fetch_operation(conn, uuid),
                        None => Ok(None),
                    }
                })
            })
            .await
    }

    async fn history(&self, query: HistoryQuery) -> GraphResult<Vec<EntityOperation>> {
        let default_limit = self.config.default_history_limit;
        self.pool
            .run(move |pool| pool.with_connection(|conn| history(conn, &query, default_limit)))
            .await
    }
}
