//! MergeEngine implementation for SQLite
//!
//! Every merge, unmerge and split runs in phases:
//!
//! 1. **validate**: read-only checks; nothing is locked or written
//! 2. **claim**: one transaction that re-checks the collection state, appends
//!    an `in_progress` operation, takes `operation_lock` on every affected
//!    collection entity with a conditional update, and stores rollback data
//! 3. **mutate**: one transaction that writes every row, reconciles
//!    relationships and counts, releases the locks and completes the
//!    operation
//! 4. **compensate**: only when mutate fails; restores prior lifecycle
//!    states, clears the locks and fails the operation
//!
//! A failed mutate transaction rolls back completely, so no partial junction
//! rows survive.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use kindred_core::{
    resolve_fields, validate_partition, Collection, CollectionEntity, EngineConfig,
    EntityOperation, GraphEntity, GraphError, GraphResult, LifecycleState, MergeEngine,
    MergeOutcome, MergeOverrides, MergeRequest, NewOperation, OperationStatus, OperationType,
    PriorEntityState, RollbackData, SplitOutcome, SplitRequest,
};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use crate::ledger::{fail_operation, insert_operation, store_rollback, transition_operation};
use crate::locks::{acquire, release, release_all};
use crate::queries::{
    entity_source_uuids, entity_sources, fetch_graph_entity, holder_of, query_all,
    require_collection, require_collection_entity, source_display_ids, source_entities,
};
use crate::reconcile::{
    attach_sources, insert_individual, insert_merged, reconcile_relationships, refresh_counts,
    update_merged_fields,
};
use crate::rows::{get_uuid, now, ts};

fn prior_state(conn: &Connection, entity: &CollectionEntity) -> SqliteResult<PriorEntityState> {
    Ok(PriorEntityState {
        uuid: entity.uuid,
        entity_id: entity.entity_id.clone(),
        lifecycle_state: entity.lifecycle_state,
        is_merged: entity.is_merged,
        source_entity_uuids: entity_source_uuids(conn, entity.uuid)?,
    })
}

fn guard(collection: &Collection, action: &str) -> SqliteResult<()> {
    collection
        .graph_state
        .guard_entity_operation(action)
        .map_err(Into::into)
}

/// Undo a claimed operation after its mutate phase failed
///
/// Returns the original error; a failure to compensate is logged and left
/// for lock maintenance.
fn compensate(
    pool: &SqlitePool,
    operation: &EntityOperation,
    rollback: &RollbackData,
    err: SqliteError,
) -> SqliteError {
    let err = GraphError::from(err);
    error!(
        operation = %operation.display_id,
        operation_type = %operation.operation_type,
        error = %err,
        "Operation failed after claiming its entities"
    );

    let message = err.to_string();
    let compensated = pool.with_transaction(|tx| {
        let released = release_all(tx, operation.uuid, Some(rollback))?;
        fail_operation(
            tx,
            operation.uuid,
            &message,
            &[
                ("phase", json!("mutate")),
                ("released_locks", json!(released)),
            ],
        )?;
        Ok(released)
    });
    match compensated {
        Ok(released) => {
            warn!(
                operation = %operation.display_id,
                released = released.len(),
                "Released locks of failed operation"
            );
        }
        Err(e) => {
            error!(
                operation = %operation.display_id,
                error = %e,
                "Could not compensate failed operation; locks remain until force release"
            );
        }
    }
    SqliteError::Graph(err)
}

// ============================================================================
// Merge
// ============================================================================

struct MergePlan {
    sources: Vec<GraphEntity>,
    /// Collection entities currently holding the sources, target excluded
    absorbed: BTreeSet<Uuid>,
    target: Option<CollectionEntity>,
}

impl MergePlan {
    fn affected(&self) -> Vec<Uuid> {
        self.target
            .iter()
            .map(|t| t.uuid)
            .chain(self.absorbed.iter().copied())
            .collect()
    }
}

fn plan_merge(conn: &Connection, request: &MergeRequest) -> SqliteResult<MergePlan> {
    request.validate()?;
    let collection = require_collection(conn, request.collection_uuid)?;
    guard(&collection, "merge")?;

    let visible: BTreeSet<Uuid> = source_entities(conn, collection.uuid)?
        .into_iter()
        .map(|e| e.uuid)
        .collect();
    let mut sources = Vec::with_capacity(request.source_entity_uuids.len());
    for uuid in &request.source_entity_uuids {
        let entity = fetch_graph_entity(conn, *uuid)?
            .ok_or_else(|| SqliteError::not_found("graph entity", uuid))?;
        if !visible.contains(uuid) {
            return Err(GraphError::validation(format!(
                "source entity {} does not belong to a document of collection {}",
                entity.display_id, collection.display_id
            ))
            .into());
        }
        sources.push(entity);
    }
    if let Some(other) = sources.iter().find(|s| s.entity_type != sources[0].entity_type) {
        return Err(GraphError::validation(format!(
            "cannot merge entities of different types: {} and {}",
            sources[0].entity_type, other.entity_type
        ))
        .into());
    }

    let target = match request.target {
        Some(uuid) => {
            let target = require_collection_entity(conn, uuid)?;
            if target.collection_uuid != collection.uuid {
                return Err(GraphError::validation(format!(
                    "target {} belongs to another collection",
                    target.display_id
                ))
                .into());
            }
            if !target.is_merged {
                return Err(GraphError::validation(format!(
                    "target {} is not a merged entity",
                    target.display_id
                ))
                .into());
            }
            if target.entity_type != sources[0].entity_type {
                return Err(GraphError::validation(format!(
                    "cannot merge {} sources into {} entity {}",
                    sources[0].entity_type, target.entity_type, target.display_id
                ))
                .into());
            }
            Some(target)
        }
        None => None,
    };

    let mut absorbed = BTreeSet::new();
    for source in &sources {
        let holder = holder_of(conn, collection.uuid, source.uuid)?.ok_or_else(|| {
            GraphError::validation(format!(
                "source entity {} is not in the collection graph yet; sync first",
                source.display_id
            ))
        })?;
        if target.as_ref().is_some_and(|t| t.uuid == holder) {
            continue;
        }
        let entity = require_collection_entity(conn, holder)?;
        if entity.is_merged {
            return Err(GraphError::conflict(format!(
                "source entity {} is already part of merged entity {}; unmerge it first",
                source.display_id, entity.display_id
            ))
            .into());
        }
        if entity.is_locked() {
            return Err(GraphError::conflict(format!(
                "entity {} is locked by another operation",
                entity.display_id
            ))
            .into());
        }
        absorbed.insert(holder);
    }
    if absorbed.is_empty() {
        return Err(GraphError::validation("every source is already part of the target").into());
    }
    if let Some(target) = &target {
        if target.is_locked() {
            return Err(GraphError::conflict(format!(
                "entity {} is locked by another operation",
                target.display_id
            ))
            .into());
        }
    }

    Ok(MergePlan {
        sources,
        absorbed,
        target,
    })
}

fn claim_merge(
    conn: &Connection,
    request: &MergeRequest,
    plan: &MergePlan,
    attempts: u32,
) -> SqliteResult<(EntityOperation, RollbackData)> {
    guard(&require_collection(conn, request.collection_uuid)?, "merge")?;

    let affected = plan.affected();
    let operation = insert_operation(
        conn,
        &NewOperation::new(request.collection_uuid, OperationType::Merged, &request.performed_by)
            .with_entities(affected.iter().copied())
            .with_details(json!({
                "sources": request.source_entity_uuids,
                "target": request.target,
                "link": request.link_uuid,
                "overrides": request.overrides,
            })),
        OperationStatus::InProgress,
        attempts,
    )?;

    let mut prior = Vec::with_capacity(affected.len());
    for uuid in &affected {
        let entity = require_collection_entity(conn, *uuid)?;
        prior.push(prior_state(conn, &entity)?);
        acquire(conn, &entity, operation.uuid, LifecycleState::Merging)?;
    }

    // Holders may have changed between validate and claim
    for source in &plan.sources {
        let holder = holder_of(conn, request.collection_uuid, source.uuid)?;
        if !holder.is_some_and(|h| affected.contains(&h)) {
            return Err(GraphError::conflict(format!(
                "source entity {} moved while the merge was being claimed",
                source.display_id
            ))
            .into());
        }
    }

    let rollback = RollbackData {
        source_entity_uuids: request.source_entity_uuids.iter().copied().collect(),
        prior_entities: prior,
    };
    let operation = store_rollback(conn, operation.uuid, &rollback)?;
    Ok((operation, rollback))
}

fn mutate_merge(
    conn: &Connection,
    request: &MergeRequest,
    plan: &MergePlan,
    operation: &EntityOperation,
    attempts: u32,
) -> SqliteResult<MergeOutcome> {
    let collection = request.collection_uuid;
    let mut all_sources = plan.sources.clone();
    let mut overrides = request.overrides.clone();
    if let Some(target) = &plan.target {
        for source in entity_sources(conn, target.uuid)? {
            if !request.source_entity_uuids.contains(&source.uuid) {
                all_sources.push(source);
            }
        }
        // A grown entity keeps its current name and description
        overrides.name = overrides.name.or_else(|| Some(target.name.clone()));
        overrides.description = overrides.description.or_else(|| target.description.clone());
    }
    let fields = resolve_fields(&all_sources, &overrides)?;

    let result = match &plan.target {
        Some(target) => {
            update_merged_fields(conn, target.uuid, &fields)?;
            if let Some(link) = request.link_uuid {
                conn.execute(
                    "UPDATE collection_entities
                     SET created_from_link_uuid = COALESCE(created_from_link_uuid, ?2)
                     WHERE uuid = ?1",
                    params![target.uuid.to_string(), link.to_string()],
                )?;
            }
            target.uuid
        }
        None => insert_merged(conn, collection, &fields, request.link_uuid, attempts)?.uuid,
    };

    let stamp = ts(&now());
    for absorbed in &plan.absorbed {
        conn.execute(
            "UPDATE entity_links SET collection_entity_uuid = ?2, updated_at = ?3
             WHERE collection_entity_uuid = ?1",
            params![absorbed.to_string(), result.to_string(), stamp],
        )?;
        conn.execute(
            "UPDATE entity_links SET merged_entity_uuid = ?2, updated_at = ?3
             WHERE merged_entity_uuid = ?1",
            params![absorbed.to_string(), result.to_string(), stamp],
        )?;
        conn.execute(
            "DELETE FROM collection_entities WHERE uuid = ?1",
            [absorbed.to_string()],
        )?;
    }

    let held: BTreeSet<Uuid> = entity_source_uuids(conn, result)?.into_iter().collect();
    attach_sources(
        conn,
        collection,
        result,
        plan.sources
            .iter()
            .map(|s| s.uuid)
            .filter(|s| !held.contains(s)),
    )?;

    if let Some(link) = request.link_uuid {
        conn.execute(
            "UPDATE entity_links SET merged_entity_uuid = ?2, collection_entity_uuid = ?2,
                 updated_at = ?3
             WHERE uuid = ?1",
            params![link.to_string(), result.to_string(), stamp],
        )?;
    }

    reconcile_relationships(conn, collection, attempts)?;
    refresh_counts(conn, collection)?;
    if plan.target.is_some() {
        release(conn, result, operation.uuid, LifecycleState::Merged)?;
    }

    let entity = require_collection_entity(conn, result)?;
    let sources = entity_source_uuids(conn, result)?;
    entity.check_source_count(sources.len())?;

    let absorbed: Vec<Uuid> = plan.absorbed.iter().copied().collect();
    let operation = transition_operation(
        conn,
        operation.uuid,
        OperationStatus::Completed,
        &[(
            "result",
            json!({
                "entity": entity.uuid,
                "display_id": entity.display_id,
                "absorbed": absorbed,
                "sources": sources,
            }),
        )],
    )?;

    Ok(MergeOutcome {
        entity,
        absorbed,
        operation,
    })
}

/// Run a merge through all of its phases
pub(crate) fn execute_merge(
    pool: &SqlitePool,
    request: &MergeRequest,
    attempts: u32,
) -> SqliteResult<MergeOutcome> {
    let plan = pool.with_connection(|conn| plan_merge(conn, request))?;
    let (operation, rollback) =
        pool.with_transaction(|tx| claim_merge(tx, request, &plan, attempts))?;
    debug!(
        operation = %operation.display_id,
        entities = plan.affected().len(),
        "Claimed entities for merge"
    );

    match pool.with_transaction(|tx| mutate_merge(tx, request, &plan, &operation, attempts)) {
        Ok(outcome) => {
            info!(
                operation = %outcome.operation.display_id,
                entity = %outcome.entity.display_id,
                absorbed = outcome.absorbed.len(),
                performed_by = %request.performed_by,
                "Merged collection entities"
            );
            Ok(outcome)
        }
        Err(err) => Err(compensate(pool, &operation, &rollback, err)),
    }
}

// ============================================================================
// Split and unmerge
// ============================================================================

struct SplitPlan {
    entity: CollectionEntity,
    sources: BTreeSet<Uuid>,
    partition: Vec<BTreeSet<Uuid>>,
}

fn plan_split(
    conn: &Connection,
    collection: Option<Uuid>,
    entity: Uuid,
    partition: Option<&[BTreeSet<Uuid>]>,
    action: &str,
) -> SqliteResult<SplitPlan> {
    let entity = require_collection_entity(conn, entity)?;
    if let Some(collection) = collection {
        if entity.collection_uuid != collection {
            return Err(GraphError::validation(format!(
                "entity {} belongs to another collection",
                entity.display_id
            ))
            .into());
        }
    }
    if !entity.is_merged {
        return Err(GraphError::validation(format!(
            "cannot {} entity {}: it is not merged",
            action, entity.display_id
        ))
        .into());
    }

    let sources: BTreeSet<Uuid> = entity_source_uuids(conn, entity.uuid)?.into_iter().collect();
    let partition = match partition {
        Some(parts) => parts.to_vec(),
        None => sources.iter().map(|s| BTreeSet::from([*s])).collect(),
    };
    validate_partition(&sources, &partition)?;

    guard(&require_collection(conn, entity.collection_uuid)?, action)?;
    if entity.is_locked() {
        return Err(GraphError::conflict(format!(
            "entity {} is locked by another operation",
            entity.display_id
        ))
        .into());
    }

    Ok(SplitPlan {
        entity,
        sources,
        partition,
    })
}

fn claim_split(
    conn: &Connection,
    plan: &SplitPlan,
    operation_type: OperationType,
    performed_by: &str,
    attempts: u32,
) -> SqliteResult<(EntityOperation, RollbackData)> {
    let collection = plan.entity.collection_uuid;
    guard(&require_collection(conn, collection)?, operation_type.as_str())?;

    let operation = insert_operation(
        conn,
        &NewOperation::new(collection, operation_type, performed_by)
            .with_entities([plan.entity.uuid])
            .with_details(json!({
                "entity": plan.entity.uuid,
                "partition": plan.partition,
            })),
        OperationStatus::InProgress,
        attempts,
    )?;

    let current = require_collection_entity(conn, plan.entity.uuid)?;
    let prior = prior_state(conn, &current)?;
    acquire(conn, &current, operation.uuid, LifecycleState::Unmerging)?;

    let sources: BTreeSet<Uuid> = prior.source_entity_uuids.iter().copied().collect();
    if sources != plan.sources {
        return Err(GraphError::conflict(format!(
            "sources of entity {} changed while the {} was being claimed",
            current.display_id, operation_type
        ))
        .into());
    }

    let rollback = RollbackData {
        source_entity_uuids: plan.sources.iter().copied().collect(),
        prior_entities: vec![prior],
    };
    let operation = store_rollback(conn, operation.uuid, &rollback)?;
    Ok((operation, rollback))
}

fn mutate_split(
    conn: &Connection,
    plan: &SplitPlan,
    operation: &EntityOperation,
    attempts: u32,
) -> SqliteResult<SplitOutcome> {
    let collection = plan.entity.collection_uuid;
    let sources: HashMap<Uuid, GraphEntity> = entity_sources(conn, plan.entity.uuid)?
        .into_iter()
        .map(|s| (s.uuid, s))
        .collect();
    let all: Vec<GraphEntity> = sources.values().cloned().collect();
    let owners = source_display_ids(conn, &all)?;

    let stamp = ts(&now());
    let deactivated = query_all(
        conn,
        "SELECT uuid FROM entity_links
         WHERE is_active = 1 AND (merged_entity_uuid = ?1 OR collection_entity_uuid = ?1)",
        [plan.entity.uuid.to_string()],
        |row| get_uuid(row, 0),
    )?;
    conn.execute(
        "UPDATE entity_links SET is_active = 0, updated_at = ?2
         WHERE is_active = 1 AND (merged_entity_uuid = ?1 OR collection_entity_uuid = ?1)",
        params![plan.entity.uuid.to_string(), stamp],
    )?;
    conn.execute(
        "DELETE FROM collection_entities WHERE uuid = ?1",
        [plan.entity.uuid.to_string()],
    )?;

    let mut entities = Vec::with_capacity(plan.partition.len());
    for part in &plan.partition {
        let members: Vec<GraphEntity> = part
            .iter()
            .map(|uuid| {
                sources
                    .get(uuid)
                    .cloned()
                    .ok_or_else(|| SqliteError::not_found("graph entity", uuid))
            })
            .collect::<SqliteResult<_>>()?;

        let entity = match members.as_slice() {
            [single] => {
                let owner = single
                    .source_uuid()
                    .and_then(|s| owners.get(&s))
                    .ok_or_else(|| SqliteError::not_found("graph entity source", single.uuid))?;
                insert_individual(conn, collection, single, owner, attempts)?
            }
            _ => {
                let fields = resolve_fields(&members, &MergeOverrides::default())?;
                let merged = insert_merged(conn, collection, &fields, None, attempts)?;
                attach_sources(conn, collection, merged.uuid, part.iter().copied())?;
                merged
            }
        };
        entity.check_source_count(part.len())?;
        entities.push(entity);
    }

    reconcile_relationships(conn, collection, attempts)?;
    refresh_counts(conn, collection)?;

    let operation = transition_operation(
        conn,
        operation.uuid,
        OperationStatus::Completed,
        &[(
            "result",
            json!({
                "entities": entities.iter().map(|e| e.uuid).collect::<Vec<_>>(),
                "deactivated_links": deactivated,
            }),
        )],
    )?;
    Ok(SplitOutcome {
        entities,
        operation,
    })
}

pub(crate) fn execute_split(
    pool: &SqlitePool,
    collection: Option<Uuid>,
    entity: Uuid,
    partition: Option<&[BTreeSet<Uuid>]>,
    performed_by: &str,
    attempts: u32,
) -> SqliteResult<SplitOutcome> {
    let (operation_type, action) = match partition {
        Some(_) => (OperationType::Split, "split"),
        None => (OperationType::Unmerged, "unmerge"),
    };
    if performed_by.trim().is_empty() {
        return Err(GraphError::validation("performed_by must not be blank").into());
    }

    let plan = pool.with_connection(|conn| plan_split(conn, collection, entity, partition, action))?;
    let (operation, rollback) = pool.with_transaction(|tx| {
        claim_split(tx, &plan, operation_type, performed_by, attempts)
    })?;
    debug!(operation = %operation.display_id, entity = %plan.entity.display_id, "Claimed entity for {}", action);

    match pool.with_transaction(|tx| mutate_split(tx, &plan, &operation, attempts)) {
        Ok(outcome) => {
            info!(
                operation = %outcome.operation.display_id,
                entity = %plan.entity.display_id,
                parts = outcome.entities.len(),
                performed_by,
                "Split merged entity"
            );
            Ok(outcome)
        }
        Err(err) => Err(compensate(pool, &operation, &rollback, err)),
    }
}

// ============================================================================
// Engine
// ============================================================================

/// SQLite implementation of MergeEngine
#[derive(Clone)]
pub struct SqliteMergeEngine {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteMergeEngine {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl MergeEngine for SqliteMergeEngine {
    async fn merge(&self, request: MergeRequest) -> GraphResult<MergeOutcome> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| execute_merge(pool, &request, attempts))
            .await
    }

    async fn unmerge(&self, entity: Uuid, performed_by: &str) -> GraphResult<SplitOutcome> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| execute_split(pool, None, entity, None, &performed_by, attempts))
            .await
    }

    async fn split(&self, request: SplitRequest) -> GraphResult<SplitOutcome> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                execute_split(
                    pool,
                    Some(request.collection_uuid),
                    request.entity_uuid,
                    Some(request.partition.as_slice()),
                    &request.performed_by,
                    attempts,
                )
            })
            .await
    }
}
