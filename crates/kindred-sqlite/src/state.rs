//! GraphStateMachine implementation for SQLite
//!
//! Initialization and sync run in three phases, each its own transaction:
//! claim the collection (guarded state update plus an `in_progress` ledger
//! row), rebuild the graph, and on failure move the collection to `error`.

use async_trait::async_trait;
use kindred_core::{
    entities_hash, Collection, DriftReport, EngineConfig, GraphError, GraphResult, GraphState,
    GraphStateMachine, GraphStatus, NewOperation, OperationStatus, OperationType, StateOutcome,
};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use crate::ledger::{fail_operation, insert_operation, transition_operation};
use crate::queries::{locked_entity_count, member_documents, require_collection, source_entities};
use crate::reconcile::reconcile;
use crate::rows::{now, ts};

/// Move a collection between graph states
///
/// The update is conditional on the current state, so a concurrent change
/// surfaces as a conflict instead of being overwritten.
pub(crate) fn transition_graph_state(
    conn: &Connection,
    collection: Uuid,
    from: GraphState,
    to: GraphState,
) -> SqliteResult<()> {
    if !from.can_transition_to(to) {
        return Err(GraphError::validation(format!(
            "collection graph cannot move from {} to {}",
            from, to
        ))
        .into());
    }
    let updated = conn.execute(
        "UPDATE collections SET graph_state = ?3, updated_at = ?4
         WHERE uuid = ?1 AND graph_state = ?2",
        params![collection.to_string(), from.as_str(), to.as_str(), ts(&now())],
    )?;
    if updated == 0 {
        return Err(GraphError::conflict(format!(
            "collection {} left {} before it could move to {}",
            collection, from, to
        ))
        .into());
    }
    info!(collection = %collection, %from, %to, "Collection graph state changed");
    Ok(())
}

/// Reject rebuilds while any member document is still being extracted
fn check_documents_settled(conn: &Connection, collection: &Collection) -> SqliteResult<()> {
    let documents = member_documents(conn, collection.uuid)?;
    let in_flight: Vec<String> = documents
        .iter()
        .filter(|d| d.extraction_status.is_in_flight())
        .map(|d| d.display_id.to_string())
        .collect();
    if !in_flight.is_empty() {
        return Err(GraphError::validation(format!(
            "documents still extracting in collection {}: {}",
            collection.display_id,
            in_flight.join(", ")
        ))
        .into());
    }
    for skipped in documents
        .iter()
        .filter(|d| d.extraction_status == kindred_core::ExtractionStatus::Error)
    {
        warn!(
            collection = %collection.display_id,
            document = %skipped.display_id,
            "Skipping document whose extraction failed"
        );
    }
    Ok(())
}

fn check_initialize_ready(conn: &Connection, collection: &Collection) -> SqliteResult<()> {
    if collection.graph_state.is_busy() {
        return Err(GraphError::conflict(format!(
            "collection {} is {}",
            collection.display_id, collection.graph_state
        ))
        .into());
    }
    if collection.graph_state != GraphState::Uninitialized {
        return Err(GraphError::validation(format!(
            "collection {} is already initialized ({})",
            collection.display_id, collection.graph_state
        ))
        .into());
    }
    check_documents_settled(conn, collection)
}

fn check_sync_ready(conn: &Connection, collection: &Collection) -> SqliteResult<()> {
    if collection.graph_state.is_busy() {
        return Err(GraphError::conflict(format!(
            "collection {} is {}",
            collection.display_id, collection.graph_state
        ))
        .into());
    }
    if !collection.graph_state.can_transition_to(GraphState::Updating) {
        return Err(GraphError::validation(format!(
            "collection {} cannot sync from {}",
            collection.display_id, collection.graph_state
        ))
        .into());
    }
    let locked = locked_entity_count(conn, collection.uuid)?;
    if locked > 0 {
        return Err(GraphError::conflict(format!(
            "collection {} has {} locked entit{}",
            collection.display_id,
            locked,
            if locked == 1 { "y" } else { "ies" }
        ))
        .into());
    }
    check_documents_settled(conn, collection)
}

/// Record the rebuilt graph's fingerprint and sync time
fn mark_built(conn: &Connection, collection: Uuid, hash: &str, first_build: bool) -> SqliteResult<()> {
    let stamp = ts(&now());
    conn.execute(
        "UPDATE collections SET entities_hash = ?2, last_sync_timestamp = ?3, updated_at = ?3
         WHERE uuid = ?1",
        params![collection.to_string(), hash, stamp],
    )?;
    if first_build {
        conn.execute(
            "UPDATE collections SET is_graph_generated = 1, graph_generated_at = ?2
             WHERE uuid = ?1",
            params![collection.to_string(), stamp],
        )?;
    }
    Ok(())
}

/// Shared shape of initialize and sync
struct Rebuild {
    operation_type: OperationType,
    idle: GraphState,
    busy: GraphState,
}

impl Rebuild {
    fn run(
        &self,
        pool: &SqlitePool,
        collection: Uuid,
        performed_by: &str,
        attempts: u32,
    ) -> SqliteResult<StateOutcome> {
        let check = |conn: &Connection, c: &Collection| match self.operation_type {
            OperationType::InitializeGraph => check_initialize_ready(conn, c),
            _ => check_sync_ready(conn, c),
        };

        // Validate
        pool.with_connection(|conn| check(conn, &require_collection(conn, collection)?))?;

        // Claim
        let (from, operation) = pool.with_transaction(|tx| {
            let current = require_collection(tx, collection)?;
            check(tx, &current)?;
            let from = current.graph_state;
            transition_graph_state(tx, collection, from, self.busy)?;
            let op = insert_operation(
                tx,
                &NewOperation::new(collection, self.operation_type, performed_by)
                    .with_details(json!({ "from_state": from.as_str() })),
                OperationStatus::InProgress,
                attempts,
            )?;
            Ok((from, op))
        })?;
        debug!(
            collection = %collection,
            operation = %operation.display_id,
            %from,
            "Claimed collection graph"
        );

        // Build
        let built = pool.with_transaction(|tx| {
            let report = reconcile(tx, collection, attempts)?;
            mark_built(
                tx,
                collection,
                &report.entities_hash,
                self.operation_type == OperationType::InitializeGraph,
            )?;
            transition_graph_state(tx, collection, self.busy, self.idle)?;
            let op = transition_operation(
                tx,
                operation.uuid,
                OperationStatus::Completed,
                &[("result", serde_json::to_value(&report)?)],
            )?;
            Ok(StateOutcome {
                collection: require_collection(tx, collection)?,
                operation: op,
            })
        });

        match built {
            Ok(outcome) => {
                info!(
                    collection = %outcome.collection.display_id,
                    operation = %outcome.operation.display_id,
                    entities = outcome.collection.counts.entity_count,
                    relationships = outcome.collection.counts.relationship_count,
                    "Collection graph {}",
                    if self.operation_type == OperationType::InitializeGraph {
                        "initialized"
                    } else {
                        "synchronized"
                    }
                );
                Ok(outcome)
            }
            Err(err) => {
                let err = GraphError::from(err);
                error!(
                    collection = %collection,
                    operation = %operation.display_id,
                    error = %err,
                    "Collection graph rebuild failed"
                );
                let message = err.to_string();
                let compensated = pool.with_transaction(|tx| {
                    transition_graph_state(tx, collection, self.busy, GraphState::Error)?;
                    fail_operation(tx, operation.uuid, &message, &[])?;
                    Ok(())
                });
                if let Err(e) = compensated {
                    error!(
                        collection = %collection,
                        operation = %operation.display_id,
                        error = %e,
                        "Could not record rebuild failure"
                    );
                }
                Err(SqliteError::Graph(err))
            }
        }
    }
}

/// SQLite implementation of GraphStateMachine
#[derive(Clone)]
pub struct SqliteStateMachine {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteStateMachine {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl GraphStateMachine for SqliteStateMachine {
    async fn initialize(&self, collection: Uuid, performed_by: &str) -> GraphResult<StateOutcome> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                Rebuild {
                    operation_type: OperationType::InitializeGraph,
                    idle: GraphState::Synchronized,
                    busy: GraphState::Initializing,
                }
                .run(pool, collection, &performed_by, attempts)
            })
            .await
    }

    async fn detect_drift(&self, collection: Uuid, performed_by: &str) -> GraphResult<DriftReport> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| {
                    let current = require_collection(tx, collection)?;
                    if current.graph_state.is_busy() {
                        return Err(GraphError::conflict(format!(
                            "collection {} is {}",
                            current.display_id, current.graph_state
                        ))
                        .into());
                    }

                    let current_hash = entities_hash(&source_entities(tx, collection)?);
                    let stored_hash = current.entities_hash.clone();
                    let drifted = current.graph_state != GraphState::Uninitialized
                        && stored_hash.as_deref() != Some(current_hash.as_str());

                    let operation = if drifted && current.graph_state == GraphState::Synchronized {
                        transition_graph_state(
                            tx,
                            collection,
                            GraphState::Synchronized,
                            GraphState::OutOfSync,
                        )?;
                        let op = insert_operation(
                            tx,
                            &NewOperation::new(collection, OperationType::DriftDetected, &performed_by)
                                .with_details(json!({
                                    "stored_hash": stored_hash,
                                    "current_hash": current_hash,
                                })),
                            OperationStatus::Completed,
                            attempts,
                        )?;
                        warn!(
                            collection = %current.display_id,
                            operation = %op.display_id,
                            "Collection graph drifted from its sources"
                        );
                        Some(op)
                    } else {
                        None
                    };

                    Ok(DriftReport {
                        collection: require_collection(tx, collection)?,
                        drifted,
                        stored_hash,
                        current_hash,
                        operation,
                    })
                })
            })
            .await
    }

    async fn sync(&self, collection: Uuid, performed_by: &str) -> GraphResult<StateOutcome> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                Rebuild {
                    operation_type: OperationType::SyncGraph,
                    idle: GraphState::Synchronized,
                    busy: GraphState::Updating,
                }
                .run(pool, collection, &performed_by, attempts)
            })
            .await
    }

    async fn graph_status(&self, collection: Uuid) -> GraphResult<GraphStatus> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    let current = require_collection(conn, collection)?;
                    Ok(GraphStatus {
                        collection_uuid: current.uuid,
                        graph_state: current.graph_state,
                        entities_hash: current.entities_hash,
                        last_sync_timestamp: current.last_sync_timestamp,
                        counts: current.counts,
                        locked_entities: locked_entity_count(conn, collection)?,
                    })
                })
            })
            .await
    }
}
