//! Shared read queries
//!
//! Plain functions over a borrowed connection, so the same lookups serve
//! read-only calls and the inside of write transactions.

use std::collections::{HashMap, HashSet};

use kindred_core::{
    Collection, CollectionEntity, DisplayId, Document, EntityLink, EntityOperation, GraphEntity,
    GraphRelationship, VisibilityProfile,
};
use rusqlite::{params, Connection, Params, Row};
use uuid::Uuid;

use crate::error::{SqliteError, SqliteResult};
use crate::rows::{
    get_display_id, get_uuid, row_to_collection, row_to_collection_entity, row_to_document,
    row_to_graph_entity, row_to_graph_relationship, row_to_link, row_to_operation,
    row_to_profile, OptionalExt, COLLECTION_COLUMNS, COLLECTION_ENTITY_COLUMNS, DOCUMENT_COLUMNS,
    GRAPH_ENTITY_COLUMNS, GRAPH_RELATIONSHIP_COLUMNS, LINK_COLUMNS, OPERATION_COLUMNS,
    PROFILE_COLUMNS,
};

pub fn query_all<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> SqliteResult<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_one<T, F>(conn: &Connection, sql: &str, uuid: Uuid, map: F) -> SqliteResult<Option<T>>
where
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    Ok(conn
        .query_row(sql, [uuid.to_string()], map)
        .optional()?)
}

// ============================================================================
// Single records
// ============================================================================

pub fn fetch_document(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<Document>> {
    let sql = format!("SELECT {} FROM documents WHERE uuid = ?1", DOCUMENT_COLUMNS);
    query_one(conn, &sql, uuid, row_to_document)
}

pub fn require_document(conn: &Connection, uuid: Uuid) -> SqliteResult<Document> {
    fetch_document(conn, uuid)?.ok_or_else(|| SqliteError::not_found("document", uuid))
}

pub fn fetch_collection(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<Collection>> {
    let sql = format!("SELECT {} FROM collections WHERE uuid = ?1", COLLECTION_COLUMNS);
    query_one(conn, &sql, uuid, row_to_collection)
}

pub fn require_collection(conn: &Connection, uuid: Uuid) -> SqliteResult<Collection> {
    fetch_collection(conn, uuid)?.ok_or_else(|| SqliteError::not_found("collection", uuid))
}

pub fn fetch_graph_entity(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<GraphEntity>> {
    let sql = format!("SELECT {} FROM graph_entities WHERE uuid = ?1", GRAPH_ENTITY_COLUMNS);
    query_one(conn, &sql, uuid, row_to_graph_entity)
}

pub fn fetch_collection_entity(
    conn: &Connection,
    uuid: Uuid,
) -> SqliteResult<Option<CollectionEntity>> {
    let sql = format!(
        "SELECT {} FROM collection_entities WHERE uuid = ?1",
        COLLECTION_ENTITY_COLUMNS
    );
    query_one(conn, &sql, uuid, row_to_collection_entity)
}

pub fn require_collection_entity(conn: &Connection, uuid: Uuid) -> SqliteResult<CollectionEntity> {
    fetch_collection_entity(conn, uuid)?
        .ok_or_else(|| SqliteError::not_found("collection entity", uuid))
}

pub fn fetch_link(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<EntityLink>> {
    let sql = format!("SELECT {} FROM entity_links WHERE uuid = ?1", LINK_COLUMNS);
    query_one(conn, &sql, uuid, row_to_link)
}

pub fn require_link(conn: &Connection, uuid: Uuid) -> SqliteResult<EntityLink> {
    fetch_link(conn, uuid)?.ok_or_else(|| SqliteError::not_found("entity link", uuid))
}

pub fn fetch_operation(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<EntityOperation>> {
    let sql = format!("SELECT {} FROM entity_operations WHERE uuid = ?1", OPERATION_COLUMNS);
    query_one(conn, &sql, uuid, row_to_operation)
}

pub fn require_operation(conn: &Connection, uuid: Uuid) -> SqliteResult<EntityOperation> {
    fetch_operation(conn, uuid)?.ok_or_else(|| SqliteError::not_found("operation", uuid))
}

pub fn fetch_profile(conn: &Connection, uuid: Uuid) -> SqliteResult<Option<VisibilityProfile>> {
    let sql = format!("SELECT {} FROM visibility_profiles WHERE uuid = ?1", PROFILE_COLUMNS);
    query_one(conn, &sql, uuid, row_to_profile)
}

// ============================================================================
// Collection membership and sources
// ============================================================================

pub fn member_documents(conn: &Connection, collection: Uuid) -> SqliteResult<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM documents
         WHERE uuid IN (SELECT document_uuid FROM collection_documents WHERE collection_uuid = ?1)
         ORDER BY created_at, uuid",
        DOCUMENT_COLUMNS
    );
    query_all(conn, &sql, [collection.to_string()], row_to_document)
}

/// Collections a document belongs to
pub fn collections_of_document(conn: &Connection, document: Uuid) -> SqliteResult<Vec<Uuid>> {
    query_all(
        conn,
        "SELECT collection_uuid FROM collection_documents WHERE document_uuid = ?1
         ORDER BY collection_uuid",
        [document.to_string()],
        |row| get_uuid(row, 0),
    )
}

/// Source-visibility predicate on `graph_entities`/`graph_relationships`
///
/// A row is visible to a collection when it is active and comes from a
/// member document whose extraction completed, or was generated for the
/// collection itself. Binds the collection uuid as `?1`.
pub(crate) const VISIBLE_TO_COLLECTION: &str = "is_active = 1 AND (
        source_file_uuid IN (
            SELECT cd.document_uuid FROM collection_documents cd
            JOIN documents d ON d.uuid = cd.document_uuid
            WHERE cd.collection_uuid = ?1 AND d.extraction_status = 'complete')
        OR source_collection_uuid = ?1)";

/// Active graph entities visible to a collection
pub fn source_entities(conn: &Connection, collection: Uuid) -> SqliteResult<Vec<GraphEntity>> {
    let sql = format!(
        "SELECT {} FROM graph_entities WHERE {} ORDER BY created_at, uuid",
        GRAPH_ENTITY_COLUMNS, VISIBLE_TO_COLLECTION
    );
    query_all(conn, &sql, [collection.to_string()], row_to_graph_entity)
}

/// Active graph relationships visible to a collection
pub fn source_relationships(
    conn: &Connection,
    collection: Uuid,
) -> SqliteResult<Vec<GraphRelationship>> {
    let sql = format!(
        "SELECT {} FROM graph_relationships WHERE {} ORDER BY created_at, uuid",
        GRAPH_RELATIONSHIP_COLUMNS, VISIBLE_TO_COLLECTION
    );
    query_all(conn, &sql, [collection.to_string()], row_to_graph_relationship)
}

/// Display id of the document or collection that owns a graph entity
pub fn source_display_ids(
    conn: &Connection,
    entities: &[GraphEntity],
) -> SqliteResult<HashMap<Uuid, DisplayId>> {
    let mut owners = HashMap::new();
    let mut stmt_doc = conn.prepare("SELECT display_id FROM documents WHERE uuid = ?1")?;
    let mut stmt_col = conn.prepare("SELECT display_id FROM collections WHERE uuid = ?1")?;
    for entity in entities {
        let Some(source) = entity.source_uuid() else {
            continue;
        };
        if owners.contains_key(&source) {
            continue;
        }
        let stmt = if entity.source_file_uuid.is_some() {
            &mut stmt_doc
        } else {
            &mut stmt_col
        };
        let display = stmt
            .query_row([source.to_string()], |row| get_display_id(row, 0))
            .optional()?
            .ok_or_else(|| SqliteError::not_found("graph entity source", source))?;
        owners.insert(source, display);
    }
    Ok(owners)
}

// ============================================================================
// Collection entities
// ============================================================================

pub fn collection_entities(
    conn: &Connection,
    collection: Uuid,
) -> SqliteResult<Vec<CollectionEntity>> {
    let sql = format!(
        "SELECT {} FROM collection_entities WHERE collection_uuid = ?1 ORDER BY entity_id",
        COLLECTION_ENTITY_COLUMNS
    );
    query_all(conn, &sql, [collection.to_string()], row_to_collection_entity)
}

pub fn entity_by_logical_id(
    conn: &Connection,
    collection: Uuid,
    entity_id: &str,
) -> SqliteResult<Option<CollectionEntity>> {
    let sql = format!(
        "SELECT {} FROM collection_entities WHERE collection_uuid = ?1 AND entity_id = ?2",
        COLLECTION_ENTITY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![collection.to_string(), entity_id], row_to_collection_entity)
        .optional()?)
}

pub fn entity_source_uuids(conn: &Connection, entity: Uuid) -> SqliteResult<Vec<Uuid>> {
    query_all(
        conn,
        "SELECT graph_entity_uuid FROM collection_entity_sources
         WHERE collection_entity_uuid = ?1 ORDER BY graph_entity_uuid",
        [entity.to_string()],
        |row| get_uuid(row, 0),
    )
}

pub fn entity_sources(conn: &Connection, entity: Uuid) -> SqliteResult<Vec<GraphEntity>> {
    let sql = format!(
        "SELECT {} FROM graph_entities
         WHERE uuid IN (SELECT graph_entity_uuid FROM collection_entity_sources
                        WHERE collection_entity_uuid = ?1)
         ORDER BY created_at, uuid",
        GRAPH_ENTITY_COLUMNS
    );
    query_all(conn, &sql, [entity.to_string()], row_to_graph_entity)
}

/// Collection entity currently backed by a source, if any
pub fn holder_of(
    conn: &Connection,
    collection: Uuid,
    graph_entity: Uuid,
) -> SqliteResult<Option<Uuid>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT collection_entity_uuid FROM collection_entity_sources
             WHERE collection_uuid = ?1 AND graph_entity_uuid = ?2",
            params![collection.to_string(), graph_entity.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| SqliteError::Serialization(e.to_string())))
        .transpose()
}

/// Source uuid to holder uuid for a whole collection
pub fn holders(conn: &Connection, collection: Uuid) -> SqliteResult<HashMap<Uuid, Uuid>> {
    let pairs = query_all(
        conn,
        "SELECT graph_entity_uuid, collection_entity_uuid FROM collection_entity_sources
         WHERE collection_uuid = ?1",
        [collection.to_string()],
        |row| Ok((get_uuid(row, 0)?, get_uuid(row, 1)?)),
    )?;
    Ok(pairs.into_iter().collect())
}

pub fn locked_entity_count(conn: &Connection, collection: Uuid) -> SqliteResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM collection_entities
         WHERE collection_uuid = ?1 AND operation_lock IS NOT NULL",
        [collection.to_string()],
        |row| row.get(0),
    )?)
}

/// Graph relationships backing each collection relationship of a collection
pub fn relationship_sources(
    conn: &Connection,
    collection: Uuid,
) -> SqliteResult<HashMap<Uuid, HashSet<Uuid>>> {
    let pairs = query_all(
        conn,
        "SELECT collection_relationship_uuid, graph_relationship_uuid
         FROM collection_relationship_sources WHERE collection_uuid = ?1",
        [collection.to_string()],
        |row| Ok((get_uuid(row, 0)?, get_uuid(row, 1)?)),
    )?;
    let mut map: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for (rel, source) in pairs {
        map.entry(rel).or_default().insert(source);
    }
    Ok(map)
}
