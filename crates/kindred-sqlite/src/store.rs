//! GraphStore implementation for SQLite
//!
//! Documents, collections and membership, per-document graph ingestion, and
//! read access to the materialized collection graph.

use std::collections::HashMap;

use async_trait::async_trait;
use kindred_core::{
    Collection, CollectionEntity, Document, EngineConfig, ExtractionStatus, GraphBatch,
    GraphEntity, GraphError, GraphRelationship, GraphResult, GraphState, GraphStore,
    IngestReport, NewCollection, NewDocument, NewOperation, OperationStatus, OperationType,
    RecordRef, ResolvedRelationship, SourceType,
};
use rusqlite::{params, Connection};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::SqliteResult;
use crate::ids::{allocate_identity, resolve_ref, Table};
use crate::ledger::insert_operation;
use crate::queries::{
    collection_entities, collections_of_document, entity_by_logical_id, entity_sources,
    fetch_collection, fetch_collection_entity, fetch_document, fetch_graph_entity, holder_of,
    locked_entity_count, query_all, relationship_sources, require_collection,
    require_collection_entity, require_document,
};
use crate::reconcile::{prune_entities, reconcile_relationships, refresh_counts};
use crate::rows::{
    get_uuid, now, opt_json, row_to_collection, row_to_collection_relationship,
    row_to_graph_entity, row_to_graph_relationship, ts, COLLECTION_COLUMNS,
    COLLECTION_RELATIONSHIP_COLUMNS, GRAPH_ENTITY_COLUMNS, GRAPH_RELATIONSHIP_COLUMNS,
};
use crate::state::transition_graph_state;

// ============================================================================
// Documents and collections
// ============================================================================

pub(crate) fn insert_document(
    conn: &Connection,
    document: &NewDocument,
    attempts: u32,
) -> SqliteResult<Document> {
    document.validate()?;
    let identity = allocate_identity(conn, Table::Documents, attempts)?;
    let stamp = ts(&now());
    conn.execute(
        "INSERT INTO documents
             (uuid, display_id, title, filename, owner, content_hash, extraction_status,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            document.title,
            document.filename,
            document.owner,
            document.content_hash,
            stamp,
        ],
    )?;
    require_document(conn, identity.uuid)
}

pub(crate) fn insert_collection(
    conn: &Connection,
    collection: &NewCollection,
    attempts: u32,
) -> SqliteResult<Collection> {
    collection.validate()?;
    if let Some(parent) = collection.parent_uuid {
        require_collection(conn, parent)?;
    }
    let identity = allocate_identity(conn, Table::Collections, attempts)?;
    let stamp = ts(&now());
    conn.execute(
        "INSERT INTO collections
             (uuid, display_id, name, description, owner, parent_uuid, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            collection.name,
            collection.description,
            collection.owner,
            collection.parent_uuid.map(|u| u.to_string()),
            stamp,
        ],
    )?;
    require_collection(conn, identity.uuid)
}

fn check_idle(collection: &Collection, action: &str) -> SqliteResult<()> {
    if collection.graph_state.is_busy() {
        return Err(GraphError::conflict(format!(
            "cannot {} while collection {} is {}",
            action, collection.display_id, collection.graph_state
        ))
        .into());
    }
    Ok(())
}

pub(crate) fn add_member(conn: &Connection, collection: Uuid, document: Uuid) -> SqliteResult<Collection> {
    let current = require_collection(conn, collection)?;
    check_idle(&current, "add a document")?;
    require_document(conn, document)?;
    conn.execute(
        "INSERT OR IGNORE INTO collection_documents (collection_uuid, document_uuid, added_at)
         VALUES (?1, ?2, ?3)",
        params![collection.to_string(), document.to_string(), ts(&now())],
    )?;
    refresh_counts(conn, collection)?;
    require_collection(conn, collection)
}

fn remove_member(conn: &Connection, collection: Uuid, document: Uuid) -> SqliteResult<Collection> {
    let current = require_collection(conn, collection)?;
    check_idle(&current, "remove a document")?;
    if locked_entity_count(conn, collection)? > 0 {
        return Err(GraphError::conflict(format!(
            "collection {} has entities locked by an operation in flight",
            current.display_id
        ))
        .into());
    }
    let removed = conn.execute(
        "DELETE FROM collection_documents WHERE collection_uuid = ?1 AND document_uuid = ?2",
        params![collection.to_string(), document.to_string()],
    )?;
    if removed == 0 {
        return Err(GraphError::validation(format!(
            "document {} is not a member of collection {}",
            document, current.display_id
        ))
        .into());
    }
    refresh_counts(conn, collection)?;
    require_collection(conn, collection)
}

fn set_extraction(
    conn: &Connection,
    document: Uuid,
    status: ExtractionStatus,
    error: Option<&str>,
) -> SqliteResult<Document> {
    let error = if status == ExtractionStatus::Error {
        error.or(Some("extraction failed"))
    } else {
        None
    };
    let updated = conn.execute(
        "UPDATE documents SET extraction_status = ?2, extraction_error = ?3, updated_at = ?4
         WHERE uuid = ?1",
        params![document.to_string(), status.as_str(), error, ts(&now())],
    )?;
    if updated == 0 {
        return Err(crate::error::SqliteError::not_found("document", document));
    }
    require_document(conn, document)
}

/// Collections touched by a document's graph, refusing when any is busy or
/// has entities locked by an operation in flight
fn affected_collections(conn: &Connection, document: Uuid, action: &str) -> SqliteResult<Vec<Collection>> {
    let mut affected = Vec::new();
    for uuid in collections_of_document(conn, document)? {
        let collection = require_collection(conn, uuid)?;
        check_idle(&collection, action)?;
        if locked_entity_count(conn, uuid)? > 0 {
            return Err(GraphError::conflict(format!(
                "cannot {} while collection {} has locked entities",
                action, collection.display_id
            ))
            .into());
        }
        affected.push(collection);
    }
    Ok(affected)
}

fn delete_document_tx(
    conn: &Connection,
    document: Uuid,
    performed_by: &str,
    attempts: u32,
) -> SqliteResult<()> {
    let doc = require_document(conn, document)?;
    let affected = affected_collections(conn, document, "delete a document")?;

    // Cascades remove graph rows, their junction rows, links and membership
    conn.execute("DELETE FROM documents WHERE uuid = ?1", [document.to_string()])?;

    for collection in affected {
        if collection.graph_state == GraphState::Uninitialized {
            refresh_counts(conn, collection.uuid)?;
            continue;
        }
        let pruned = prune_entities(conn, collection.uuid)?;
        let relationships = reconcile_relationships(conn, collection.uuid, attempts)?;
        let counts = refresh_counts(conn, collection.uuid)?;
        if collection.graph_state == GraphState::Synchronized {
            transition_graph_state(
                conn,
                collection.uuid,
                GraphState::Synchronized,
                GraphState::OutOfSync,
            )?;
        }
        insert_operation(
            conn,
            &NewOperation::new(collection.uuid, OperationType::Deleted, performed_by)
                .with_description(format!("document {} deleted", doc.display_id))
                .with_details(json!({
                    "document": doc.uuid,
                    "document_display_id": doc.display_id,
                    "entities": pruned,
                    "relationships": relationships,
                    "counts": counts,
                })),
            OperationStatus::Completed,
            attempts,
        )?;
    }

    info!(document = %doc.display_id, "Deleted document");
    Ok(())
}

// ============================================================================
// Graph ingestion
// ============================================================================

fn document_graph_entities(conn: &Connection, document: Uuid, active_only: bool) -> SqliteResult<Vec<GraphEntity>> {
    let sql = format!(
        "SELECT {} FROM graph_entities WHERE source_file_uuid = ?1 AND (?2 = 0 OR is_active = 1)
         ORDER BY created_at, entity_id",
        GRAPH_ENTITY_COLUMNS
    );
    query_all(conn, &sql, params![document.to_string(), active_only], row_to_graph_entity)
}

fn document_graph_relationships(conn: &Connection, document: Uuid) -> SqliteResult<Vec<GraphRelationship>> {
    let sql = format!(
        "SELECT {} FROM graph_relationships WHERE source_file_uuid = ?1",
        GRAPH_RELATIONSHIP_COLUMNS
    );
    query_all(conn, &sql, [document.to_string()], row_to_graph_relationship)
}

/// Upsert a document's extracted graph
///
/// Entities are matched by `entity_id` and relationships by endpoints, type
/// and `relationship_id`, so unchanged rows keep their uuid and
/// `updated_at`. Rows missing from the batch are deactivated, not deleted,
/// so collection views built on them stay intact until the next sync.
pub(crate) fn ingest(
    conn: &Connection,
    document: Uuid,
    batch: &GraphBatch,
    attempts: u32,
) -> SqliteResult<IngestReport> {
    batch.validate()?;
    let doc = require_document(conn, document)?;
    affected_collections(conn, document, "re-extract a document")?;
    let stamp = ts(&now());
    let source_type = SourceType::File.as_str();

    let existing: HashMap<String, GraphEntity> = document_graph_entities(conn, document, false)?
        .into_iter()
        .map(|e| (e.entity_id.clone(), e))
        .collect();
    let mut uuids: HashMap<&str, Uuid> = HashMap::new();
    let mut replaced = 0;

    for entity in &batch.entities {
        match existing.get(&entity.entity_id) {
            Some(row) => {
                let changed = !row.is_active
                    || row.entity_type != entity.entity_type
                    || row.name != entity.name
                    || row.description != entity.description
                    || row.properties != entity.properties;
                if changed {
                    conn.execute(
                        "UPDATE graph_entities
                         SET entity_type = ?2, name = ?3, description = ?4, properties = ?5,
                             created_by_tool = ?6, is_active = 1, updated_at = ?7
                         WHERE uuid = ?1",
                        params![
                            row.uuid.to_string(),
                            entity.entity_type,
                            entity.name,
                            entity.description,
                            opt_json(&entity.properties),
                            batch.created_by_tool,
                            stamp,
                        ],
                    )?;
                    replaced += 1;
                }
                uuids.insert(entity.entity_id.as_str(), row.uuid);
            }
            None => {
                let identity = allocate_identity(conn, Table::GraphEntities, attempts)?;
                conn.execute(
                    "INSERT INTO graph_entities
                         (uuid, display_id, entity_id, entity_type, name, description, properties,
                          source_type, source_file_uuid, created_by_tool, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                    params![
                        identity.uuid.to_string(),
                        identity.display_id.as_str(),
                        entity.entity_id,
                        entity.entity_type,
                        entity.name,
                        entity.description,
                        opt_json(&entity.properties),
                        source_type,
                        document.to_string(),
                        batch.created_by_tool,
                        stamp,
                    ],
                )?;
                uuids.insert(entity.entity_id.as_str(), identity.uuid);
            }
        }
    }

    for row in existing.values() {
        if row.is_active && !uuids.contains_key(row.entity_id.as_str()) {
            conn.execute(
                "UPDATE graph_entities SET is_active = 0, updated_at = ?2 WHERE uuid = ?1",
                params![row.uuid.to_string(), stamp],
            )?;
            replaced += 1;
        }
    }

    type RelKey = (Uuid, Uuid, String, Option<String>);
    let existing_rels: HashMap<RelKey, GraphRelationship> = document_graph_relationships(conn, document)?
        .into_iter()
        .map(|r| {
            (
                (
                    r.source_entity_uuid,
                    r.target_entity_uuid,
                    r.relationship_type.clone(),
                    r.relationship_id.clone(),
                ),
                r,
            )
        })
        .collect();
    let mut kept: Vec<Uuid> = Vec::new();

    for rel in &batch.relationships {
        let (Some(source), Some(target)) = (
            uuids.get(rel.source_entity_id.as_str()),
            uuids.get(rel.target_entity_id.as_str()),
        ) else {
            continue;
        };
        let key = (*source, *target, rel.relationship_type.clone(), rel.relationship_id.clone());
        match existing_rels.get(&key) {
            Some(row) => {
                let changed = !row.is_active
                    || row.is_directed != rel.is_directed
                    || row.weight != rel.weight
                    || row.confidence_score != rel.confidence_score
                    || row.properties != rel.properties;
                if changed {
                    conn.execute(
                        "UPDATE graph_relationships
                         SET is_directed = ?2, weight = ?3, confidence_score = ?4, properties = ?5,
                             created_by_tool = ?6, is_active = 1, updated_at = ?7
                         WHERE uuid = ?1",
                        params![
                            row.uuid.to_string(),
                            rel.is_directed,
                            rel.weight,
                            rel.confidence_score,
                            opt_json(&rel.properties),
                            batch.created_by_tool,
                            stamp,
                        ],
                    )?;
                }
                kept.push(row.uuid);
            }
            None => {
                let identity = allocate_identity(conn, Table::GraphRelationships, attempts)?;
                conn.execute(
                    "INSERT INTO graph_relationships
                         (uuid, display_id, source_entity_uuid, target_entity_uuid, relationship_id,
                          relationship_type, source_type, source_file_uuid, is_directed, weight,
                          confidence_score, properties, created_by_tool, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                    params![
                        identity.uuid.to_string(),
                        identity.display_id.as_str(),
                        source.to_string(),
                        target.to_string(),
                        rel.relationship_id,
                        rel.relationship_type,
                        source_type,
                        document.to_string(),
                        rel.is_directed,
                        rel.weight,
                        rel.confidence_score,
                        opt_json(&rel.properties),
                        batch.created_by_tool,
                        stamp,
                    ],
                )?;
                kept.push(identity.uuid);
            }
        }
    }

    for row in existing_rels.values() {
        if row.is_active && !kept.contains(&row.uuid) {
            conn.execute(
                "UPDATE graph_relationships SET is_active = 0, updated_at = ?2 WHERE uuid = ?1",
                params![row.uuid.to_string(), stamp],
            )?;
        }
    }

    set_extraction(conn, document, ExtractionStatus::Complete, None)?;

    info!(
        document = %doc.display_id,
        entities = batch.entities.len(),
        relationships = batch.relationships.len(),
        replaced,
        "Ingested document graph"
    );
    Ok(IngestReport {
        document_uuid: document,
        entity_count: batch.entities.len(),
        relationship_count: batch.relationships.len(),
        replaced_entities: replaced,
    })
}

// ============================================================================
// Collection relationships
// ============================================================================

/// Resolve a logical entity id against the collection's current merge state
///
/// The id names a collection entity directly, or is an individual id
/// (`<source display id>:<entity_id>`) whose source has since been merged
/// into another entity.
fn resolve_logical(
    conn: &Connection,
    collection: Uuid,
    entity_id: &str,
) -> SqliteResult<Option<CollectionEntity>> {
    if let Some(entity) = entity_by_logical_id(conn, collection, entity_id)? {
        return Ok(Some(entity));
    }
    let Some((display, source_entity_id)) = entity_id.split_once(':') else {
        return Ok(None);
    };
    let graph_entity: Option<Uuid> = query_all(
        conn,
        "SELECT ge.uuid FROM graph_entities ge
         LEFT JOIN documents d ON d.uuid = ge.source_file_uuid
         LEFT JOIN collections c ON c.uuid = ge.source_collection_uuid
         WHERE ge.entity_id = ?2
           AND (d.display_id = ?1 OR (ge.source_file_uuid IS NULL AND c.display_id = ?1))",
        params![display, source_entity_id],
        |row| get_uuid(row, 0),
    )?
    .into_iter()
    .next();
    let Some(graph_entity) = graph_entity else {
        return Ok(None);
    };
    match holder_of(conn, collection, graph_entity)? {
        Some(holder) => fetch_collection_entity(conn, holder),
        None => Ok(None),
    }
}

pub(crate) fn resolved_relationships(
    conn: &Connection,
    collection: Uuid,
) -> SqliteResult<Vec<ResolvedRelationship>> {
    let sql = format!(
        "SELECT {} FROM collection_relationships WHERE collection_uuid = ?1
         ORDER BY source_entity_id, target_entity_id, relationship_type",
        COLLECTION_RELATIONSHIP_COLUMNS
    );
    let rows = query_all(conn, &sql, [collection.to_string()], row_to_collection_relationship)?;
    let sources = relationship_sources(conn, collection)?;

    let mut resolved = Vec::with_capacity(rows.len());
    for relationship in rows {
        let source = resolve_logical(conn, collection, &relationship.source_entity_id)?;
        let target = resolve_logical(conn, collection, &relationship.target_entity_id)?;
        match (source, target) {
            (Some(source), Some(target)) => resolved.push(ResolvedRelationship {
                source_count: sources.get(&relationship.uuid).map_or(0, |s| s.len()),
                relationship,
                source,
                target,
            }),
            _ => warn!(
                collection = %collection,
                relationship = %relationship.display_id,
                "Skipping relationship with an unresolvable endpoint"
            ),
        }
    }
    Ok(resolved)
}

// ============================================================================
// Store
// ============================================================================

/// SQLite implementation of GraphStore
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Delete a document, attributing the ledger entries to `performed_by`
    pub async fn delete_document_as(&self, document: Uuid, performed_by: &str) -> GraphResult<()> {
        let performed_by = performed_by.to_string();
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| delete_document_tx(tx, document, &performed_by, attempts))
            })
            .await
    }
}

/// Actor recorded for deletions made through the trait
const SYSTEM_ACTOR: &str = "system";

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn create_document(&self, document: NewDocument) -> GraphResult<Document> {
        let attempts = self.config.display_id_attempts;
        let doc = self
            .pool
            .run(move |pool| pool.with_transaction(|tx| insert_document(tx, &document, attempts)))
            .await?;
        debug!(document = %doc.display_id, title = %doc.title, "Created document");
        Ok(doc)
    }

    async fn get_document(&self, id: &RecordRef) -> GraphResult<Option<Document>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| match resolve_ref(conn, Table::Documents, &id)? {
                    Some(uuid) => fetch_document(conn, uuid),
                    None => Ok(None),
                })
            })
            .await
    }

    async fn set_extraction_status(
        &self,
        document: Uuid,
        status: ExtractionStatus,
        error: Option<String>,
    ) -> GraphResult<Document> {
        self.pool
            .run(move |pool| {
                pool.with_transaction(|tx| set_extraction(tx, document, status, error.as_deref()))
            })
            .await
    }

    async fn delete_document(&self, document: Uuid) -> GraphResult<()> {
        self.delete_document_as(document, SYSTEM_ACTOR).await
    }

    async fn create_collection(&self, collection: NewCollection) -> GraphResult<Collection> {
        let attempts = self.config.display_id_attempts;
        let created = self
            .pool
            .run(move |pool| {
                pool.with_transaction(|tx| insert_collection(tx, &collection, attempts))
            })
            .await?;
        info!(collection = %created.display_id, name = %created.name, "Created collection");
        Ok(created)
    }

    async fn get_collection(&self, id: &RecordRef) -> GraphResult<Option<Collection>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| match resolve_ref(conn, Table::Collections, &id)? {
                    Some(uuid) => fetch_collection(conn, uuid),
                    None => Ok(None),
                })
            })
            .await
    }

    async fn child_collections(&self, parent: Uuid) -> GraphResult<Vec<Collection>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_collection(conn, parent)?;
                    let sql = format!(
                        "SELECT {} FROM collections WHERE parent_uuid = ?1 ORDER BY name, uuid",
                        COLLECTION_COLUMNS
                    );
                    query_all(conn, &sql, [parent.to_string()], row_to_collection)
                })
            })
            .await
    }

    async fn add_document(&self, collection: Uuid, document: Uuid) -> GraphResult<Collection> {
        self.pool
            .run(move |pool| pool.with_transaction(|tx| add_member(tx, collection, document)))
            .await
    }

    async fn remove_document(&self, collection: Uuid, document: Uuid) -> GraphResult<Collection> {
        self.pool
            .run(move |pool| pool.with_transaction(|tx| remove_member(tx, collection, document)))
            .await
    }

    async fn ingest_graph(&self, document: Uuid, batch: GraphBatch) -> GraphResult<IngestReport> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| pool.with_transaction(|tx| ingest(tx, document, &batch, attempts)))
            .await
    }

    async fn graph_entities(&self, document: Uuid) -> GraphResult<Vec<GraphEntity>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_document(conn, document)?;
                    document_graph_entities(conn, document, true)
                })
            })
            .await
    }

    async fn get_graph_entity(&self, id: &RecordRef) -> GraphResult<Option<GraphEntity>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| match resolve_ref(conn, Table::GraphEntities, &id)? {
                    Some(uuid) => fetch_graph_entity(conn, uuid),
                    None => Ok(None),
                })
            })
            .await
    }

    async fn collection_entities(&self, collection: Uuid) -> GraphResult<Vec<CollectionEntity>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_collection(conn, collection)?;
                    collection_entities(conn, collection)
                })
            })
            .await
    }

    async fn get_collection_entity(&self, id: &RecordRef) -> GraphResult<Option<CollectionEntity>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    match resolve_ref(conn, Table::CollectionEntities, &id)? {
                        Some(uuid) => fetch_collection_entity(conn, uuid),
                        None => Ok(None),
                    }
                })
            })
            .await
    }

    async fn entity_sources(&self, entity: Uuid) -> GraphResult<Vec<GraphEntity>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_collection_entity(conn, entity)?;
                    entity_sources(conn, entity)
                })
            })
            .await
    }

    async fn collection_relationships(
        &self,
        collection: Uuid,
    ) -> GraphResult<Vec<ResolvedRelationship>> {
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    require_collection(conn, collection)?;
                    resolved_relationships(conn, collection)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_core::{NewGraphEntity, NewGraphRelationship};

    fn store() -> SqliteGraphStore {
        SqliteGraphStore::new(SqlitePool::memory().unwrap(), EngineConfig::default())
    }

    fn batch() -> GraphBatch {
        GraphBatch::new("extractor-v2")
            .entity(NewGraphEntity::new("e1", "organization", "Acme Corp"))
            .entity(NewGraphEntity::new("e2", "person", "Wile E. Coyote"))
            .relationship(NewGraphRelationship::new("e2", "e1", "customer_of"))
    }

    #[tokio::test]
    async fn test_document_lookup_by_either_id() {
        let store = store();
        let doc = store
            .create_document(NewDocument::new("Annual report", "user:alice"))
            .await
            .unwrap();
        assert_eq!(doc.extraction_status, ExtractionStatus::Pending);

        let by_display = store
            .get_document(&RecordRef::Display(doc.display_id.clone()))
            .await
            .unwrap();
        assert_eq!(by_display, Some(doc.clone()));
        let by_uuid = store.get_document(&RecordRef::Uuid(doc.uuid)).await.unwrap();
        assert_eq!(by_uuid, Some(doc));
    }

    #[tokio::test]
    async fn test_ingest_marks_complete_and_keeps_unchanged_rows() {
        let store = store();
        let doc = store
            .create_document(NewDocument::new("Annual report", "user:alice"))
            .await
            .unwrap();

        let report = store.ingest_graph(doc.uuid, batch()).await.unwrap();
        assert_eq!(report.entity_count, 2);
        assert_eq!(report.replaced_entities, 0);
        let first = store.graph_entities(doc.uuid).await.unwrap();

        let doc = store.get_document(&doc.uuid.into()).await.unwrap().unwrap();
        assert_eq!(doc.extraction_status, ExtractionStatus::Complete);

        // Same batch again: nothing replaced, uuids and timestamps stable
        let report = store.ingest_graph(doc.uuid, batch()).await.unwrap();
        assert_eq!(report.replaced_entities, 0);
        assert_eq!(store.graph_entities(doc.uuid).await.unwrap(), first);

        // Drop e2, rename e1
        let smaller = GraphBatch::new("extractor-v3")
            .entity(NewGraphEntity::new("e1", "organization", "Acme Corporation"));
        let report = store.ingest_graph(doc.uuid, smaller).await.unwrap();
        assert_eq!(report.replaced_entities, 2);
        let active = store.graph_entities(doc.uuid).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Acme Corporation");
        assert_eq!(active[0].uuid, first.iter().find(|e| e.entity_id == "e1").unwrap().uuid);
    }

    #[tokio::test]
    async fn test_invalid_batch_writes_nothing() {
        let store = store();
        let doc = store
            .create_document(NewDocument::new("Annual report", "user:alice"))
            .await
            .unwrap();
        let bad = batch().relationship(NewGraphRelationship::new("e1", "missing", "owns"));
        let err = store.ingest_graph(doc.uuid, bad).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
        assert!(store.graph_entities(doc.uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_membership_updates_document_count() {
        let store = store();
        let collection = store
            .create_collection(NewCollection::new("Research", "user:alice"))
            .await
            .unwrap();
        let doc = store
            .create_document(NewDocument::new("Annual report", "user:alice"))
            .await
            .unwrap();

        let updated = store.add_document(collection.uuid, doc.uuid).await.unwrap();
        assert_eq!(updated.counts.document_count, 1);
        // Adding twice is a no-op
        let updated = store.add_document(collection.uuid, doc.uuid).await.unwrap();
        assert_eq!(updated.counts.document_count, 1);

        let updated = store.remove_document(collection.uuid, doc.uuid).await.unwrap();
        assert_eq!(updated.counts.document_count, 0);
        let err = store.remove_document(collection.uuid, doc.uuid).await.unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[tokio::test]
    async fn test_child_collections() {
        let store = store();
        let parent = store
            .create_collection(NewCollection::new("Research", "user:alice"))
            .await
            .unwrap();
        let child = store
            .create_collection(NewCollection::new("Competitors", "user:alice").with_parent(parent.uuid))
            .await
            .unwrap();

        let children = store.child_collections(parent.uuid).await.unwrap();
        assert_eq!(children.into_iter().map(|c| c.uuid).collect::<Vec<_>>(), vec![child.uuid]);

        let orphan = store
            .create_collection(NewCollection::new("Orphan", "user:alice").with_parent(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(orphan, GraphError::NotFound { kind: "collection", .. }));
    }

    #[tokio::test]
    async fn test_extraction_error_keeps_message() {
        let store = store();
        let doc = store
            .create_document(NewDocument::new("Scan", "user:alice"))
            .await
            .unwrap();
        let doc = store
            .set_extraction_status(doc.uuid, ExtractionStatus::Error, Some("ocr timeout".into()))
            .await
            .unwrap();
        assert_eq!(doc.extraction_error.as_deref(), Some("ocr timeout"));

        let doc = store
            .set_extraction_status(doc.uuid, ExtractionStatus::Processing, None)
            .await
            .unwrap();
        assert_eq!(doc.extraction_error, None);
    }
}
