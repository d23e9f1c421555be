//! Collection graph reconciliation
//!
//! Brings the materialized collection graph in line with its sources:
//! collection entities against the visible graph entities, and collection
//! relationships against the visible graph relationships. Everything here
//! runs inside the caller's transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use kindred_core::{
    individual_entity_id, merged_entity_id, CollectionCounts, CollectionEntity,
    CollectionRelationship, DisplayId, GraphEntity, GraphError, GraphRelationship, LifecycleState,
    ResolvedFields,
};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SqliteResult;
use crate::ids::{allocate_identity, Table};
use crate::queries::{
    collection_entities, entity_sources, holders, query_all, relationship_sources,
    require_collection_entity, source_display_ids, source_entities, source_relationships,
    VISIBLE_TO_COLLECTION,
};
use crate::rows::{get_uuid, now, opt_json, row_to_collection_relationship, ts, COLLECTION_RELATIONSHIP_COLUMNS};

// ============================================================================
// Entity rows
// ============================================================================

struct EntityRow<'a> {
    collection: Uuid,
    entity_id: Option<String>,
    entity_type: &'a str,
    name: &'a str,
    description: Option<&'a str>,
    properties: &'a Option<serde_json::Value>,
    is_merged: bool,
    created_from_link: Option<Uuid>,
    lifecycle: LifecycleState,
}

fn insert_entity_row(
    conn: &Connection,
    row: EntityRow<'_>,
    attempts: u32,
) -> SqliteResult<CollectionEntity> {
    let identity = allocate_identity(conn, Table::CollectionEntities, attempts)?;
    let entity_id = row
        .entity_id
        .unwrap_or_else(|| merged_entity_id(&identity.display_id));
    let now = ts(&now());

    conn.execute(
        "INSERT INTO collection_entities
             (uuid, display_id, collection_uuid, entity_id, entity_type, name, description,
              properties, is_merged, created_from_link_uuid, lifecycle_state, created_at,
              updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            row.collection.to_string(),
            entity_id,
            row.entity_type,
            row.name,
            row.description,
            opt_json(row.properties),
            row.is_merged,
            row.created_from_link.map(|u| u.to_string()),
            row.lifecycle.as_str(),
            now,
        ],
    )?;
    require_collection_entity(conn, identity.uuid)
}

/// Create the individual collection entity for one source, with its junction row
pub(crate) fn insert_individual(
    conn: &Connection,
    collection: Uuid,
    source: &GraphEntity,
    owner: &DisplayId,
    attempts: u32,
) -> SqliteResult<CollectionEntity> {
    let entity = insert_entity_row(
        conn,
        EntityRow {
            collection,
            entity_id: Some(individual_entity_id(owner, &source.entity_id)),
            entity_type: &source.entity_type,
            name: &source.name,
            description: source.description.as_deref(),
            properties: &source.properties,
            is_merged: false,
            created_from_link: None,
            lifecycle: LifecycleState::Individual,
        },
        attempts,
    )?;
    attach_sources(conn, collection, entity.uuid, [source.uuid])?;
    Ok(entity)
}

/// Create a merged collection entity; the caller attaches its sources
pub(crate) fn insert_merged(
    conn: &Connection,
    collection: Uuid,
    fields: &ResolvedFields,
    link: Option<Uuid>,
    attempts: u32,
) -> SqliteResult<CollectionEntity> {
    insert_entity_row(
        conn,
        EntityRow {
            collection,
            entity_id: None,
            entity_type: &fields.entity_type,
            name: &fields.name,
            description: fields.description.as_deref(),
            properties: &fields.properties,
            is_merged: true,
            created_from_link: link,
            lifecycle: LifecycleState::Merged,
        },
        attempts,
    )
}

/// Overwrite the resolved fields of an existing merged entity
pub(crate) fn update_merged_fields(
    conn: &Connection,
    entity: Uuid,
    fields: &ResolvedFields,
) -> SqliteResult<()> {
    conn.execute(
        "UPDATE collection_entities
         SET entity_type = ?2, name = ?3, description = ?4, properties = ?5, updated_at = ?6
         WHERE uuid = ?1",
        params![
            entity.to_string(),
            fields.entity_type,
            fields.name,
            fields.description,
            opt_json(&fields.properties),
            ts(&now()),
        ],
    )?;
    Ok(())
}

pub(crate) fn attach_sources(
    conn: &Connection,
    collection: Uuid,
    entity: Uuid,
    sources: impl IntoIterator<Item = Uuid>,
) -> SqliteResult<()> {
    let added_at = ts(&now());
    let mut stmt = conn.prepare(
        "INSERT INTO collection_entity_sources
             (collection_entity_uuid, graph_entity_uuid, collection_uuid, added_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for source in sources {
        stmt.execute(params![
            entity.to_string(),
            source.to_string(),
            collection.to_string(),
            added_at
        ])?;
    }
    Ok(())
}

/// Make an entity the individual view of its single source
///
/// Used both to demote a merged entity left with one source and to refresh
/// an individual entity whose source was re-extracted.
fn become_individual(
    conn: &Connection,
    entity: &CollectionEntity,
    source: &GraphEntity,
    owner: &DisplayId,
) -> SqliteResult<bool> {
    let entity_id = individual_entity_id(owner, &source.entity_id);
    let unchanged = !entity.is_merged
        && entity.entity_id == entity_id
        && entity.entity_type == source.entity_type
        && entity.name == source.name
        && entity.description == source.description
        && entity.properties == source.properties
        && entity.lifecycle_state == LifecycleState::Individual;
    if unchanged {
        return Ok(false);
    }

    conn.execute(
        "UPDATE collection_entities
         SET entity_id = ?2, entity_type = ?3, name = ?4, description = ?5, properties = ?6,
             is_merged = 0, created_from_link_uuid = NULL, lifecycle_state = 'individual',
             updated_at = ?7
         WHERE uuid = ?1",
        params![
            entity.uuid.to_string(),
            entity_id,
            source.entity_type,
            source.name,
            source.description,
            opt_json(&source.properties),
            ts(&now()),
        ],
    )?;
    Ok(true)
}

/// Delete a collection entity, deactivating the links that targeted it
pub(crate) fn delete_entity(conn: &Connection, entity: Uuid) -> SqliteResult<()> {
    conn.execute(
        "UPDATE entity_links SET is_active = 0, updated_at = ?2
         WHERE collection_entity_uuid = ?1 AND is_active = 1",
        params![entity.to_string(), ts(&now())],
    )?;
    conn.execute(
        "DELETE FROM collection_entities WHERE uuid = ?1",
        [entity.to_string()],
    )?;
    Ok(())
}

pub(crate) fn refresh_counts(conn: &Connection, collection: Uuid) -> SqliteResult<CollectionCounts> {
    conn.execute(
        "UPDATE collections SET
             entity_count = (SELECT COUNT(*) FROM collection_entities WHERE collection_uuid = ?1),
             relationship_count =
                 (SELECT COUNT(*) FROM collection_relationships WHERE collection_uuid = ?1),
             document_count =
                 (SELECT COUNT(*) FROM collection_documents WHERE collection_uuid = ?1),
             updated_at = ?2
         WHERE uuid = ?1",
        params![collection.to_string(), ts(&now())],
    )?;
    Ok(conn.query_row(
        "SELECT entity_count, relationship_count, document_count FROM collections WHERE uuid = ?1",
        [collection.to_string()],
        |row| {
            Ok(CollectionCounts {
                entity_count: row.get(0)?,
                relationship_count: row.get(1)?,
                document_count: row.get(2)?,
            })
        },
    )?)
}

// ============================================================================
// Relationships
// ============================================================================

/// Changes made by one relationship reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelationshipDelta {
    pub inserted: usize,
    pub rewritten: usize,
    pub removed: usize,
}

/// Identity of a collection relationship within its collection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RelationshipKey {
    source: String,
    target: String,
    relationship_type: String,
    is_directed: bool,
}

impl RelationshipKey {
    /// Undirected edges order their endpoints, so A-B and B-A share a key
    fn new(source: &str, target: &str, relationship_type: &str, is_directed: bool) -> Self {
        let (source, target) = if !is_directed && target < source {
            (target, source)
        } else {
            (source, target)
        };
        Self {
            source: source.to_string(),
            target: target.to_string(),
            relationship_type: relationship_type.to_string(),
            is_directed,
        }
    }

    fn of(row: &CollectionRelationship) -> Self {
        Self::new(
            &row.source_entity_id,
            &row.target_entity_id,
            &row.relationship_type,
            row.is_directed,
        )
    }
}

/// Rebuild collection relationships from the visible graph relationships
///
/// Each graph relationship whose endpoints are both held maps to the key
/// (holder of source, holder of target, type, directedness); one collection relationship
/// exists per key. Existing rows keep their identity when their key still
/// exists, or when one of their source rows moved to a new key (after a merge
/// or split); everything else is removed.
pub(crate) fn reconcile_relationships(
    conn: &Connection,
    collection: Uuid,
    attempts: u32,
) -> SqliteResult<RelationshipDelta> {
    let holder = holders(conn, collection)?;
    let logical: HashMap<Uuid, String> = collection_entities(conn, collection)?
        .into_iter()
        .map(|e| (e.uuid, e.entity_id))
        .collect();

    let graph_rels: HashMap<Uuid, GraphRelationship> = source_relationships(conn, collection)?
        .into_iter()
        .map(|r| (r.uuid, r))
        .collect();

    let mut desired: BTreeMap<RelationshipKey, BTreeSet<Uuid>> = BTreeMap::new();
    for rel in graph_rels.values() {
        let endpoints = holder
            .get(&rel.source_entity_uuid)
            .and_then(|s| logical.get(s))
            .zip(holder.get(&rel.target_entity_uuid).and_then(|t| logical.get(t)));
        if let Some((source, target)) = endpoints {
            desired
                .entry(RelationshipKey::new(
                    source,
                    target,
                    &rel.relationship_type,
                    rel.is_directed,
                ))
                .or_default()
                .insert(rel.uuid);
        }
    }

    let sql = format!(
        "SELECT {} FROM collection_relationships WHERE collection_uuid = ?1
         ORDER BY created_at, uuid",
        COLLECTION_RELATIONSHIP_COLUMNS
    );
    let existing = query_all(conn, &sql, [collection.to_string()], row_to_collection_relationship)?;
    let current_sources = relationship_sources(conn, collection)?;

    // Exact key matches first, so rewrites never collide with a live key
    let mut assigned: HashMap<Uuid, RelationshipKey> = HashMap::new();
    let mut claimed: HashSet<RelationshipKey> = HashSet::new();
    for row in &existing {
        let key = RelationshipKey::of(row);
        if desired.contains_key(&key) && claimed.insert(key.clone()) {
            assigned.insert(row.uuid, key);
        }
    }
    for row in &existing {
        if assigned.contains_key(&row.uuid) {
            continue;
        }
        let Some(sources) = current_sources.get(&row.uuid) else {
            continue;
        };
        let moved = desired
            .iter()
            .find(|(key, set)| !claimed.contains(*key) && set.iter().any(|s| sources.contains(s)))
            .map(|(key, _)| key.clone());
        if let Some(key) = moved {
            claimed.insert(key.clone());
            assigned.insert(row.uuid, key);
        }
    }

    let mut delta = RelationshipDelta::default();
    let stamp = ts(&now());

    for row in &existing {
        match assigned.get(&row.uuid) {
            None => {
                conn.execute(
                    "DELETE FROM collection_relationships WHERE uuid = ?1",
                    [row.uuid.to_string()],
                )?;
                delta.removed += 1;
            }
            Some(key) => {
                if row.source_entity_id != key.source
                    || row.target_entity_id != key.target
                    || row.is_directed != key.is_directed
                {
                    conn.execute(
                        "UPDATE collection_relationships
                         SET source_entity_id = ?2, target_entity_id = ?3, is_directed = ?4,
                             updated_at = ?5
                         WHERE uuid = ?1",
                        params![
                            row.uuid.to_string(),
                            key.source,
                            key.target,
                            key.is_directed,
                            stamp
                        ],
                    )?;
                    delta.rewritten += 1;
                }
            }
        }
    }

    // Junction rows: drop the stale ones before adding, since a graph
    // relationship backs at most one row per collection
    for (rel, key) in &assigned {
        let wanted = &desired[key];
        if let Some(current) = current_sources.get(rel) {
            for stale in current.iter().filter(|s| !wanted.contains(s)) {
                conn.execute(
                    "DELETE FROM collection_relationship_sources
                     WHERE collection_relationship_uuid = ?1 AND graph_relationship_uuid = ?2",
                    params![rel.to_string(), stale.to_string()],
                )?;
            }
        }
    }

    let mut owner_of: HashMap<RelationshipKey, Uuid> =
        assigned.iter().map(|(rel, key)| (key.clone(), *rel)).collect();
    for (key, sources) in &desired {
        if owner_of.contains_key(key) {
            continue;
        }
        let newest = sources
            .iter()
            .filter_map(|s| graph_rels.get(s))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uuid.cmp(&b.uuid)));
        let identity = allocate_identity(conn, Table::CollectionRelationships, attempts)?;
        conn.execute(
            "INSERT INTO collection_relationships
                 (uuid, display_id, collection_uuid, source_entity_id, target_entity_id,
                  relationship_type, is_directed, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                identity.uuid.to_string(),
                identity.display_id.as_str(),
                collection.to_string(),
                key.source,
                key.target,
                key.relationship_type,
                key.is_directed,
                newest.and_then(|r| opt_json(&r.properties)),
                stamp,
            ],
        )?;
        owner_of.insert(key.clone(), identity.uuid);
        delta.inserted += 1;
    }

    let mut stmt = conn.prepare(
        "INSERT INTO collection_relationship_sources
             (collection_relationship_uuid, graph_relationship_uuid, collection_uuid, added_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, sources) in &desired {
        let rel = owner_of[key];
        let current = current_sources.get(&rel);
        for source in sources {
            if current.is_some_and(|c| c.contains(source)) {
                continue;
            }
            stmt.execute(params![
                rel.to_string(),
                source.to_string(),
                collection.to_string(),
                stamp
            ])?;
        }
    }

    debug!(
        collection = %collection,
        inserted = delta.inserted,
        rewritten = delta.rewritten,
        removed = delta.removed,
        "Reconciled collection relationships"
    );
    Ok(delta)
}

// ============================================================================
// Entities
// ============================================================================

/// Source counts per collection entity, from the junction table
fn source_counts(conn: &Connection, collection: Uuid) -> SqliteResult<HashMap<Uuid, usize>> {
    let rows = query_all(
        conn,
        "SELECT ce.uuid, COUNT(ces.graph_entity_uuid)
         FROM collection_entities ce
         LEFT JOIN collection_entity_sources ces ON ces.collection_entity_uuid = ce.uuid
         WHERE ce.collection_uuid = ?1
         GROUP BY ce.uuid",
        [collection.to_string()],
        |row| Ok((get_uuid(row, 0)?, row.get::<_, i64>(1)?)),
    )?;
    Ok(rows
        .into_iter()
        .map(|(uuid, n)| (uuid, usize::try_from(n).unwrap_or(0)))
        .collect())
}

/// Fail on corruption no reconciliation can repair
///
/// An individual entity backed by several sources cannot be split without a
/// decision, and a transitional lifecycle without a lock has lost its owner.
pub(crate) fn check_repairable(conn: &Connection, collection: Uuid) -> SqliteResult<()> {
    let counts = source_counts(conn, collection)?;
    for entity in collection_entities(conn, collection)? {
        let n = counts.get(&entity.uuid).copied().unwrap_or(0);
        if !entity.is_merged && n > 1 {
            return Err(GraphError::corruption(format!(
                "individual entity {} has {} sources",
                entity.display_id, n
            ))
            .into());
        }
        if entity.lifecycle_state.is_transitional() && !entity.is_locked() {
            return Err(GraphError::corruption(format!(
                "entity {} is {} without an operation lock",
                entity.display_id, entity.lifecycle_state
            ))
            .into());
        }
    }
    Ok(())
}

/// Verify source cardinality of every collection entity
pub(crate) fn check_invariants(conn: &Connection, collection: Uuid) -> SqliteResult<()> {
    let counts = source_counts(conn, collection)?;
    for entity in collection_entities(conn, collection)? {
        let n = counts.get(&entity.uuid).copied().unwrap_or(0);
        entity.check_source_count(n)?;
    }
    Ok(())
}

/// Entity changes made by one pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub removed: usize,
    pub demoted: usize,
    pub refreshed: usize,
}

/// Delete entities without sources, demote merged entities left with one,
/// and refresh individual entities from their source
pub(crate) fn prune_entities(conn: &Connection, collection: Uuid) -> SqliteResult<PruneReport> {
    let mut report = PruneReport::default();
    for entity in collection_entities(conn, collection)? {
        let sources = entity_sources(conn, entity.uuid)?;
        match sources.as_slice() {
            [] => {
                delete_entity(conn, entity.uuid)?;
                report.removed += 1;
            }
            [source] => {
                let owners = source_display_ids(conn, std::slice::from_ref(source))?;
                let Some(owner) = source.source_uuid().and_then(|s| owners.get(&s)) else {
                    continue;
                };
                let was_merged = entity.is_merged;
                if become_individual(conn, &entity, source, owner)? {
                    if was_merged {
                        report.demoted += 1;
                    } else {
                        report.refreshed += 1;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(report)
}

/// Result of a full reconciliation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub dropped_sources: usize,
    pub entities: PruneReport,
    pub added: usize,
    pub relationships: RelationshipDelta,
    pub counts: CollectionCounts,
    /// Fingerprint of the sources the graph was rebuilt from
    pub entities_hash: String,
}

/// Reconcile the whole collection graph against its sources
pub(crate) fn reconcile(
    conn: &Connection,
    collection: Uuid,
    attempts: u32,
) -> SqliteResult<ReconcileReport> {
    check_repairable(conn, collection)?;

    let dropped_sources = conn.execute(
        &format!(
            "DELETE FROM collection_entity_sources
             WHERE collection_uuid = ?1
               AND graph_entity_uuid NOT IN (SELECT uuid FROM graph_entities WHERE {})",
            VISIBLE_TO_COLLECTION
        ),
        [collection.to_string()],
    )?;
    if dropped_sources > 0 {
        warn!(collection = %collection, dropped_sources, "Sources vanished from collection");
    }

    let entities = prune_entities(conn, collection)?;

    let sources = source_entities(conn, collection)?;
    let owners = source_display_ids(conn, &sources)?;
    let held = holders(conn, collection)?;
    let mut added = 0;
    for source in sources.iter().filter(|s| !held.contains_key(&s.uuid)) {
        let Some(owner) = source.source_uuid().and_then(|s| owners.get(&s)) else {
            continue;
        };
        insert_individual(conn, collection, source, owner, attempts)?;
        added += 1;
    }

    let relationships = reconcile_relationships(conn, collection, attempts)?;
    let counts = refresh_counts(conn, collection)?;
    check_invariants(conn, collection)?;

    let report = ReconcileReport {
        dropped_sources,
        entities,
        added,
        relationships,
        counts,
        entities_hash: kindred_core::entities_hash(&sources),
    };
    debug!(
        collection = %collection,
        added = report.added,
        removed = report.entities.removed,
        demoted = report.entities.demoted,
        "Reconciled collection entities"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{fetch_collection, holder_of};
    use crate::store::{add_member, ingest, insert_collection, insert_document};
    use kindred_core::{GraphBatch, NewCollection, NewDocument, NewGraphEntity, NewGraphRelationship};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        crate::schema::apply_migrations(&conn).unwrap();
        conn
    }

    fn seed(conn: &Connection) -> (Uuid, Uuid) {
        let collection = insert_collection(conn, &NewCollection::new("Research", "user:alice"), 4)
            .unwrap()
            .uuid;
        let doc = insert_document(conn, &NewDocument::new("Report", "user:alice"), 4)
            .unwrap()
            .uuid;
        add_member(conn, collection, doc).unwrap();
        ingest(
            conn,
            doc,
            &GraphBatch::new("extractor")
                .entity(NewGraphEntity::new("e1", "organization", "Acme Corp"))
                .entity(NewGraphEntity::new("e2", "person", "Wile E. Coyote"))
                .relationship(NewGraphRelationship::new("e2", "e1", "customer_of")),
            4,
        )
        .unwrap();
        (collection, doc)
    }

    #[test]
    fn test_reconcile_builds_individual_view() {
        let conn = conn();
        let (collection, doc) = seed(&conn);

        let report = reconcile(&conn, collection, 4).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.relationships.inserted, 1);
        assert_eq!(report.counts.entity_count, 2);
        assert_eq!(report.counts.relationship_count, 1);
        assert_eq!(report.counts.document_count, 1);

        let display = fetch_collection(&conn, collection).unwrap().unwrap();
        assert_eq!(display.counts, report.counts);

        let entities = collection_entities(&conn, collection).unwrap();
        let doc_display = DisplayId::derive(&doc);
        assert!(entities
            .iter()
            .any(|e| e.entity_id == format!("{}:e1", doc_display)));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let conn = conn();
        let (collection, _) = seed(&conn);

        let first = reconcile(&conn, collection, 4).unwrap();
        let second = reconcile(&conn, collection, 4).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.relationships, RelationshipDelta::default());
        assert_eq!(second.entities, PruneReport::default());
        assert_eq!(first.entities_hash, second.entities_hash);
    }

    #[test]
    fn test_entity_without_sources_is_removed() {
        let conn = conn();
        let (collection, doc) = seed(&conn);
        reconcile(&conn, collection, 4).unwrap();

        conn.execute(
            "UPDATE graph_entities SET is_active = 0 WHERE source_file_uuid = ?1 AND entity_id = 'e2'",
            [doc.to_string()],
        )
        .unwrap();
        let report = reconcile(&conn, collection, 4).unwrap();
        assert_eq!(report.dropped_sources, 1);
        assert_eq!(report.entities.removed, 1);
        assert_eq!(report.relationships.removed, 1);
        assert_eq!(report.counts.entity_count, 1);
    }

    #[test]
    fn test_individual_with_two_sources_is_corruption() {
        let conn = conn();
        let (collection, _) = seed(&conn);
        reconcile(&conn, collection, 4).unwrap();

        let entities = collection_entities(&conn, collection).unwrap();
        let (keep, drop) = (&entities[0], &entities[1]);
        let moved = entity_sources(&conn, drop.uuid).unwrap()[0].uuid;
        conn.execute(
            "UPDATE collection_entity_sources SET collection_entity_uuid = ?1
             WHERE graph_entity_uuid = ?2",
            params![keep.uuid.to_string(), moved.to_string()],
        )
        .unwrap();
        assert_eq!(holder_of(&conn, collection, moved).unwrap(), Some(keep.uuid));

        let err: GraphError = reconcile(&conn, collection, 4).unwrap_err().into();
        assert!(matches!(err, GraphError::StateCorruption(_)));
    }

    #[test]
    fn test_undirected_edges_share_one_relationship() {
        let conn = conn();
        let collection = insert_collection(&conn, &NewCollection::new("Research", "user:alice"), 4)
            .unwrap()
            .uuid;
        let doc = insert_document(&conn, &NewDocument::new("Report", "user:alice"), 4)
            .unwrap()
            .uuid;
        add_member(&conn, collection, doc).unwrap();
        ingest(
            &conn,
            doc,
            &GraphBatch::new("extractor")
                .entity(NewGraphEntity::new("e1", "organization", "Acme Corp"))
                .entity(NewGraphEntity::new("e2", "organization", "Roadrunner Ltd"))
                .relationship(NewGraphRelationship::new("e2", "e1", "partner_of").undirected())
                .relationship(NewGraphRelationship::new("e1", "e2", "partner_of").undirected())
                .relationship(NewGraphRelationship {
                    relationship_id: Some("r3".to_string()),
                    ..NewGraphRelationship::new("e2", "e1", "partner_of")
                }),
            4,
        )
        .unwrap();

        let report = reconcile(&conn, collection, 4).unwrap();
        assert_eq!(report.relationships.inserted, 2);
        assert_eq!(report.counts.relationship_count, 2);

        let rows = query_all(
            &conn,
            &format!(
                "SELECT {} FROM collection_relationships WHERE collection_uuid = ?1",
                COLLECTION_RELATIONSHIP_COLUMNS
            ),
            [collection.to_string()],
            row_to_collection_relationship,
        )
        .unwrap();
        let sources = relationship_sources(&conn, collection).unwrap();
        let undirected = rows.iter().find(|r| !r.is_directed).unwrap();
        assert!(undirected.source_entity_id < undirected.target_entity_id);
        assert_eq!(sources[&undirected.uuid].len(), 2);
        let directed = rows.iter().find(|r| r.is_directed).unwrap();
        assert!(directed.source_entity_id.ends_with(":e2"));
        assert_eq!(sources[&directed.uuid].len(), 1);

        let again = reconcile(&conn, collection, 4).unwrap();
        assert_eq!(again.relationships, RelationshipDelta::default());
    }
}
