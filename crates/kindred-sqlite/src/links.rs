//! LinkResolver implementation for SQLite
//!
//! Proposing a link never touches collection entities. Confirming one hands a
//! merge request to the merge engine, which records the link on the merged
//! entity inside its mutate transaction.

use async_trait::async_trait;
use kindred_core::{
    candidate_order, ConfirmOutcome, EngineConfig, EntityLink, GraphError, GraphResult,
    LinkOutcome, LinkProposal, LinkResolver, MergeRequest, NewOperation, OperationStatus,
    OperationType, RecordRef,
};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use crate::ids::{allocate_identity, resolve_ref, Table};
use crate::ledger::insert_operation;
use crate::merge::execute_merge;
use crate::queries::{
    entity_source_uuids, fetch_graph_entity, fetch_link, holder_of, query_all, require_collection,
    require_collection_entity, require_link, source_entities,
};
use crate::rows::{now, row_to_link, ts, LINK_COLUMNS};

fn check_not_busy(conn: &Connection, collection: Uuid) -> SqliteResult<()> {
    let collection = require_collection(conn, collection)?;
    if collection.graph_state.is_busy() {
        return Err(GraphError::conflict(format!(
            "collection {} is {}",
            collection.display_id, collection.graph_state
        ))
        .into());
    }
    Ok(())
}

pub(crate) fn propose(
    conn: &Connection,
    proposal: &LinkProposal,
    attempts: u32,
) -> SqliteResult<LinkOutcome> {
    proposal.validate()?;
    let collection = proposal.collection_uuid;
    check_not_busy(conn, collection)?;

    let source = fetch_graph_entity(conn, proposal.graph_entity_uuid)?
        .ok_or_else(|| SqliteError::not_found("graph entity", proposal.graph_entity_uuid))?;
    if !source_entities(conn, collection)?
        .iter()
        .any(|e| e.uuid == source.uuid)
    {
        return Err(GraphError::validation(format!(
            "graph entity {} does not belong to a document of the collection",
            source.display_id
        ))
        .into());
    }

    if let Some(target) = proposal.collection_entity_uuid {
        let target = require_collection_entity(conn, target)?;
        if target.collection_uuid != collection {
            return Err(GraphError::validation(format!(
                "link target {} belongs to another collection",
                target.display_id
            ))
            .into());
        }
        if target.entity_type != source.entity_type {
            return Err(GraphError::validation(format!(
                "cannot link {} entity {} to {} entity {}",
                source.entity_type, source.display_id, target.entity_type, target.display_id
            ))
            .into());
        }
        if holder_of(conn, collection, source.uuid)? == Some(target.uuid) {
            return Err(GraphError::validation(format!(
                "graph entity {} already backs {}",
                source.display_id, target.display_id
            ))
            .into());
        }
    }

    let identity = allocate_identity(conn, Table::EntityLinks, attempts)?;
    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM entity_links",
        [],
        |row| row.get(0),
    )?;
    let stamp = ts(&now());
    conn.execute(
        "INSERT INTO entity_links
             (uuid, display_id, seq, collection_uuid, graph_entity_uuid, collection_entity_uuid,
              entity_type, confidence_score, link_type, is_active, common_name, description,
              created_by_tool, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11, ?12, ?13, ?13)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            seq,
            collection.to_string(),
            source.uuid.to_string(),
            proposal.collection_entity_uuid.map(|u| u.to_string()),
            source.entity_type,
            proposal.confidence_score,
            proposal.link_type.as_str(),
            proposal.common_name,
            proposal.description,
            proposal.created_by_tool,
            stamp,
        ],
    )?;

    let operation = insert_operation(
        conn,
        &NewOperation::new(collection, OperationType::Link, &proposal.performed_by)
            .with_entities(
                std::iter::once(source.uuid).chain(proposal.collection_entity_uuid),
            )
            .with_details(json!({
                "link": identity.uuid,
                "graph_entity": source.uuid,
                "collection_entity": proposal.collection_entity_uuid,
                "confidence_score": proposal.confidence_score,
                "link_type": proposal.link_type,
            })),
        OperationStatus::Completed,
        attempts,
    )?;

    let link = require_link(conn, identity.uuid)?;
    info!(
        link = %link.display_id,
        graph_entity = %source.display_id,
        confidence = proposal.confidence_score,
        link_type = %proposal.link_type,
        "Proposed entity link"
    );
    Ok(LinkOutcome { link, operation })
}

/// Merge request that confirming `link` performs
fn confirmation_request(
    conn: &Connection,
    link: &EntityLink,
    performed_by: &str,
) -> SqliteResult<MergeRequest> {
    if !link.is_active {
        return Err(GraphError::validation(format!("link {} is inactive", link.display_id)).into());
    }
    if link.is_confirmed() {
        return Err(
            GraphError::validation(format!("link {} is already confirmed", link.display_id)).into(),
        );
    }
    let (Some(source), Some(target)) = (link.graph_entity_uuid, link.collection_entity_uuid) else {
        return Err(GraphError::validation(format!(
            "link {} has no target to merge into",
            link.display_id
        ))
        .into());
    };

    let target = require_collection_entity(conn, target)?;
    let request = if target.is_merged {
        MergeRequest::new(link.collection_uuid, [source], performed_by).into_target(target.uuid)
    } else {
        let sources = entity_source_uuids(conn, target.uuid)?;
        MergeRequest::new(
            link.collection_uuid,
            std::iter::once(source).chain(sources),
            performed_by,
        )
    };
    Ok(request.from_link(link.uuid))
}

pub(crate) fn confirm(
    pool: &SqlitePool,
    link: Uuid,
    performed_by: &str,
    attempts: u32,
) -> SqliteResult<ConfirmOutcome> {
    let request = pool.with_connection(|conn| {
        let link = require_link(conn, link)?;
        confirmation_request(conn, &link, performed_by)
    })?;
    let merge = execute_merge(pool, &request, attempts)?;
    let link = pool.with_connection(|conn| require_link(conn, link))?;
    info!(
        link = %link.display_id,
        entity = %merge.entity.display_id,
        "Confirmed entity link"
    );
    Ok(ConfirmOutcome { link, merge })
}

pub(crate) fn deactivate(
    conn: &Connection,
    link: Uuid,
    performed_by: &str,
    attempts: u32,
) -> SqliteResult<LinkOutcome> {
    let current = require_link(conn, link)?;
    if !current.is_active {
        return Err(GraphError::validation(format!(
            "link {} is already inactive",
            current.display_id
        ))
        .into());
    }
    check_not_busy(conn, current.collection_uuid)?;

    let updated = conn.execute(
        "UPDATE entity_links SET is_active = 0, updated_at = ?2 WHERE uuid = ?1 AND is_active = 1",
        params![link.to_string(), ts(&now())],
    )?;
    if updated == 0 {
        return Err(GraphError::conflict(format!(
            "link {} changed concurrently",
            current.display_id
        ))
        .into());
    }

    let operation = insert_operation(
        conn,
        &NewOperation::new(current.collection_uuid, OperationType::Unlink, performed_by)
            .with_entities(current.graph_entity_uuid.into_iter().chain(current.collection_entity_uuid))
            .with_details(json!({
                "link": current.uuid,
                "merged_entity": current.merged_entity_uuid,
            })),
        OperationStatus::Completed,
        attempts,
    )?;
    info!(link = %current.display_id, performed_by, "Deactivated entity link");
    Ok(LinkOutcome {
        link: require_link(conn, link)?,
        operation,
    })
}

pub(crate) fn best_candidate(
    conn: &Connection,
    collection: Uuid,
    graph_entity: Uuid,
) -> SqliteResult<Option<EntityLink>> {
    let sql = format!(
        "SELECT {} FROM entity_links
         WHERE collection_uuid = ?1 AND graph_entity_uuid = ?2 AND is_active = 1
           AND merged_entity_uuid IS NULL AND collection_entity_uuid IS NOT NULL",
        LINK_COLUMNS
    );
    let mut links = query_all(
        conn,
        &sql,
        params![collection.to_string(), graph_entity.to_string()],
        row_to_link,
    )?;
    links.sort_by(candidate_order);
    Ok(links.into_iter().next())
}

/// SQLite implementation of LinkResolver
#[derive(Clone)]
pub struct SqliteLinkResolver {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteLinkResolver {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl LinkResolver for SqliteLinkResolver {
    async fn propose_link(&self, proposal: LinkProposal) -> GraphResult<LinkOutcome> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| pool.with_transaction(|tx| propose(tx, &proposal, attempts)))
            .await
    }

    async fn confirm_link(&self, link: Uuid, performed_by: &str) -> GraphResult<ConfirmOutcome> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| confirm(pool, link, &performed_by, attempts))
            .await
    }

    async fn deactivate_link(&self, link: Uuid, performed_by: &str) -> GraphResult<LinkOutcome> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| deactivate(tx, link, &performed_by, attempts))
            })
            .await
    }

    async fn get_link(&self, id: &RecordRef) -> GraphResult<Option<EntityLink>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| match resolve_ref(conn, Table::EntityLinks, &id)? {
                    Some(uuid) => fetch_link(conn, uuid),
                    None => Ok(None),
                })
            })
            .await
    }

    async fn active_links(&self, entity: Uuid) -> GraphResult<Vec<EntityLink>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_collection_entity(conn, entity)?;
                    let sql = format!(
                        "SELECT {} FROM entity_links
                         WHERE collection_entity_uuid = ?1 AND is_active = 1
                         ORDER BY seq",
                        LINK_COLUMNS
                    );
                    query_all(conn, &sql, [entity.to_string()], row_to_link)
                })
            })
            .await
    }

    async fn best_candidate(
        &self,
        collection: Uuid,
        graph_entity: Uuid,
    ) -> GraphResult<Option<EntityLink>> {
        self.pool
            .run(move |pool| pool.with_connection(|conn| best_candidate(conn, collection, graph_entity)))
            .await
    }
}
