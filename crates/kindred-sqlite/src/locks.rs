//! Entity operation locks
//!
//! A lock is the `operation_lock` column of a collection entity, naming the
//! in-flight operation that owns it. Locks are taken and cleared with
//! conditional updates only.

use async_trait::async_trait;
use chrono::Duration;
use kindred_core::{
    CollectionEntity, EngineConfig, GraphError, GraphResult, LifecycleState, LockMaintenance,
    NewOperation, OperationStatus, OperationType, ReleasedLock, RollbackData,
};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::SqliteResult;
use crate::ledger::{fail_operation, insert_operation};
use crate::queries::{fetch_operation, query_all, require_collection_entity};
use crate::rows::{
    get_uuid, now, row_to_collection_entity, ts, COLLECTION_ENTITY_COLUMNS,
};

/// Lock an idle entity for `operation`, moving it to `lifecycle`
pub(crate) fn acquire(
    conn: &Connection,
    entity: &CollectionEntity,
    operation: Uuid,
    lifecycle: LifecycleState,
) -> SqliteResult<()> {
    let stamp = ts(&now());
    let updated = conn.execute(
        "UPDATE collection_entities
         SET operation_lock = ?2, operation_locked_at = ?3, lifecycle_state = ?4, updated_at = ?3
         WHERE uuid = ?1 AND operation_lock IS NULL",
        params![
            entity.uuid.to_string(),
            operation.to_string(),
            stamp,
            lifecycle.as_str()
        ],
    )?;
    if updated == 0 {
        warn!(entity = %entity.display_id, "Entity already locked");
        return Err(GraphError::conflict(format!(
            "entity {} is locked by another operation",
            entity.display_id
        ))
        .into());
    }
    debug!(entity = %entity.display_id, operation = %operation, "Locked entity");
    Ok(())
}

/// Clear the lock `operation` holds on `entity`
pub(crate) fn release(
    conn: &Connection,
    entity: Uuid,
    operation: Uuid,
    lifecycle: LifecycleState,
) -> SqliteResult<()> {
    let updated = conn.execute(
        "UPDATE collection_entities
         SET operation_lock = NULL, operation_locked_at = NULL, lifecycle_state = ?3,
             updated_at = ?4
         WHERE uuid = ?1 AND operation_lock = ?2",
        params![
            entity.to_string(),
            operation.to_string(),
            lifecycle.as_str(),
            ts(&now())
        ],
    )?;
    if updated == 0 {
        return Err(GraphError::conflict(format!(
            "entity {} is no longer locked by operation {}",
            entity, operation
        ))
        .into());
    }
    Ok(())
}

/// Clear every lock held by `operation`
///
/// Each entity returns to the lifecycle recorded in `rollback`, or `error`
/// when none was captured. Returns the released entities.
pub(crate) fn release_all(
    conn: &Connection,
    operation: Uuid,
    rollback: Option<&RollbackData>,
) -> SqliteResult<Vec<Uuid>> {
    let locked = query_all(
        conn,
        "SELECT uuid FROM collection_entities WHERE operation_lock = ?1",
        [operation.to_string()],
        |row| get_uuid(row, 0),
    )?;
    for entity in &locked {
        let restored = rollback
            .and_then(|r| r.prior_state_of(*entity))
            .unwrap_or(LifecycleState::Error);
        release(conn, *entity, operation, restored)?;
    }
    Ok(locked)
}

pub(crate) fn stale_locks(
    conn: &Connection,
    older_than: Duration,
) -> SqliteResult<Vec<CollectionEntity>> {
    if older_than < Duration::zero() {
        return Err(GraphError::validation("stale lock threshold must not be negative").into());
    }
    let threshold = now().checked_sub_signed(older_than).ok_or_else(|| {
        GraphError::validation(format!(
            "stale lock threshold of {}s is out of range",
            older_than.num_seconds()
        ))
    })?;
    let sql = format!(
        "SELECT {} FROM collection_entities
         WHERE operation_lock IS NOT NULL AND operation_locked_at <= ?1
         ORDER BY operation_locked_at, uuid",
        COLLECTION_ENTITY_COLUMNS
    );
    query_all(conn, &sql, [ts(&threshold)], row_to_collection_entity)
}

pub(crate) fn force_release(
    conn: &Connection,
    entity: Uuid,
    performed_by: &str,
    reason: &str,
    attempts: u32,
) -> SqliteResult<ReleasedLock> {
    if reason.trim().is_empty() {
        return Err(GraphError::validation("force release needs a reason").into());
    }
    let current = require_collection_entity(conn, entity)?;
    let Some(lock) = current.operation_lock else {
        return Err(GraphError::validation(format!(
            "entity {} is not locked",
            current.display_id
        ))
        .into());
    };

    let owner = fetch_operation(conn, lock)?;
    let restored = owner
        .as_ref()
        .and_then(|op| op.rollback())
        .and_then(|r| r.prior_state_of(entity))
        .unwrap_or(LifecycleState::Error);
    release(conn, entity, lock, restored)?;

    let owner = match owner {
        Some(op) if !op.status.is_terminal() => Some(fail_operation(
            conn,
            op.uuid,
            &format!("lock force-released: {}", reason),
            &[("phase", json!("force_unlock"))],
        )?),
        other => other,
    };

    let operation = insert_operation(
        conn,
        &NewOperation::new(current.collection_uuid, OperationType::ForceUnlock, performed_by)
            .with_entities([entity])
            .with_details(json!({
                "owner_operation": lock,
                "reason": reason,
                "locked_at": current.operation_locked_at,
                "restored_state": restored,
                "error": reason,
            })),
        OperationStatus::Failed,
        attempts,
    )?;

    warn!(
        entity = %current.display_id,
        owner = %lock,
        operation = %operation.display_id,
        restored = %restored,
        performed_by,
        "Force-released entity lock"
    );
    Ok(ReleasedLock {
        entity: require_collection_entity(conn, entity)?,
        owner,
        operation,
    })
}

/// SQLite implementation of LockMaintenance
#[derive(Clone)]
pub struct SqliteLockMaintenance {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteLockMaintenance {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl LockMaintenance for SqliteLockMaintenance {
    async fn stale_locks(&self, older_than: Option<Duration>) -> GraphResult<Vec<CollectionEntity>> {
        let older_than = match older_than {
            Some(threshold) => threshold,
            None => self.config.stale_lock_after()?,
        };
        self.pool
            .run(move |pool| pool.with_connection(|conn| stale_locks(conn, older_than)))
            .await
    }

    async fn force_release(
        &self,
        entity: Uuid,
        performed_by: &str,
        reason: &str,
    ) -> GraphResult<ReleasedLock> {
        let performed_by = performed_by.to_string();
        let reason = reason.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| {
                    force_release(tx, entity, &performed_by, &reason, attempts)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store_rollback;
    use crate::queries::require_operation;
    use crate::reconcile::reconcile;
    use crate::store::{add_member, ingest, insert_collection, insert_document};
    use kindred_core::{
        GraphBatch, NewCollection, NewDocument, NewGraphEntity, PriorEntityState,
    };

    fn setup(conn: &Connection) -> (Uuid, CollectionEntity) {
        let doc = insert_document(conn, &NewDocument::new("Filing", "ana"), 8).unwrap();
        ingest(
            conn,
            doc.uuid,
            &GraphBatch::new("extractor")
                .entity(NewGraphEntity::new("e1", "organization", "Acme Corp")),
            8,
        )
        .unwrap();
        let coll = insert_collection(conn, &NewCollection::new("Deals", "ana"), 8).unwrap();
        add_member(conn, coll.uuid, doc.uuid).unwrap();
        reconcile(conn, coll.uuid, 8).unwrap();
        let entity = crate::queries::collection_entities(conn, coll.uuid)
            .unwrap()
            .remove(0);
        (coll.uuid, entity)
    }

    fn open_merge(conn: &Connection, collection: Uuid, entity: &CollectionEntity) -> Uuid {
        let op = insert_operation(
            conn,
            &NewOperation::new(collection, OperationType::Merged, "ana"),
            OperationStatus::InProgress,
            8,
        )
        .unwrap();
        acquire(conn, entity, op.uuid, LifecycleState::Merging).unwrap();
        op.uuid
    }

    #[test]
    fn test_second_lock_conflicts() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (coll, entity) = setup(conn);
            open_merge(conn, coll, &entity);
            let op = insert_operation(
                conn,
                &NewOperation::new(coll, OperationType::Split, "bo"),
                OperationStatus::InProgress,
                8,
            )?;
            let err = GraphError::from(
                acquire(conn, &entity, op.uuid, LifecycleState::Unmerging).unwrap_err(),
            );
            assert!(err.is_retryable());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_release_all_restores_prior_state() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (coll, entity) = setup(conn);
            let op = open_merge(conn, coll, &entity);
            let rollback = RollbackData {
                source_entity_uuids: vec![],
                prior_entities: vec![PriorEntityState {
                    uuid: entity.uuid,
                    entity_id: entity.entity_id.clone(),
                    lifecycle_state: LifecycleState::Individual,
                    is_merged: false,
                    source_entity_uuids: vec![],
                }],
            };
            let released = release_all(conn, op, Some(&rollback))?;
            assert_eq!(released, vec![entity.uuid]);

            let after = require_collection_entity(conn, entity.uuid)?;
            assert!(after.operation_lock.is_none());
            assert!(after.operation_locked_at.is_none());
            assert_eq!(after.lifecycle_state, LifecycleState::Individual);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stale_locks_respect_threshold() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (coll, entity) = setup(conn);
            open_merge(conn, coll, &entity);

            assert!(stale_locks(conn, Duration::minutes(5))?.is_empty());
            let stale = stale_locks(conn, Duration::zero())?;
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].uuid, entity.uuid);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_force_release_leaves_ledger_trace() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (coll, entity) = setup(conn);
            let op = open_merge(conn, coll, &entity);
            store_rollback(
                conn,
                op,
                &RollbackData {
                    source_entity_uuids: vec![],
                    prior_entities: vec![PriorEntityState {
                        uuid: entity.uuid,
                        entity_id: entity.entity_id.clone(),
                        lifecycle_state: LifecycleState::Individual,
                        is_merged: false,
                        source_entity_uuids: vec![],
                    }],
                },
            )?;

            let released = force_release(conn, entity.uuid, "ops", "worker crashed", 8)?;
            assert!(released.entity.operation_lock.is_none());
            assert_eq!(released.entity.lifecycle_state, LifecycleState::Individual);
            assert_eq!(released.operation.operation_type, OperationType::ForceUnlock);
            assert_eq!(released.operation.status, OperationStatus::Failed);
            assert_eq!(released.operation.error(), Some("worker crashed"));

            let owner = require_operation(conn, op)?;
            assert_eq!(owner.status, OperationStatus::Failed);
            assert!(owner.error().unwrap().contains("worker crashed"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_force_release_without_rollback_marks_error() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (coll, entity) = setup(conn);
            open_merge(conn, coll, &entity);
            let released = force_release(conn, entity.uuid, "ops", "stuck", 8)?;
            assert_eq!(released.entity.lifecycle_state, LifecycleState::Error);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_force_release_requires_lock_and_reason() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            let (_, entity) = setup(conn);
            let err = GraphError::from(force_release(conn, entity.uuid, "ops", "x", 8).unwrap_err());
            assert_eq!(err.kind(), "validation");
            let err = GraphError::from(force_release(conn, entity.uuid, "ops", " ", 8).unwrap_err());
            assert_eq!(err.kind(), "validation");
            Ok(())
        })
        .unwrap();
    }
}
