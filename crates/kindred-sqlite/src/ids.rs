//! Display id allocation and record reference lookup

use kindred_core::{RecordIdentity, RecordRef};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use crate::error::{SqliteError, SqliteResult};
use crate::rows::OptionalExt;

/// Tables whose rows carry a dual identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Documents,
    Collections,
    GraphEntities,
    GraphRelationships,
    CollectionEntities,
    CollectionRelationships,
    EntityLinks,
    EntityOperations,
    VisibilityProfiles,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Documents => "documents",
            Table::Collections => "collections",
            Table::GraphEntities => "graph_entities",
            Table::GraphRelationships => "graph_relationships",
            Table::CollectionEntities => "collection_entities",
            Table::CollectionRelationships => "collection_relationships",
            Table::EntityLinks => "entity_links",
            Table::EntityOperations => "entity_operations",
            Table::VisibilityProfiles => "visibility_profiles",
        }
    }

    /// Record kind used in not-found errors
    pub fn kind(&self) -> &'static str {
        match self {
            Table::Documents => "document",
            Table::Collections => "collection",
            Table::GraphEntities => "graph entity",
            Table::GraphRelationships => "graph relationship",
            Table::CollectionEntities => "collection entity",
            Table::CollectionRelationships => "collection relationship",
            Table::EntityLinks => "entity link",
            Table::EntityOperations => "operation",
            Table::VisibilityProfiles => "visibility profile",
        }
    }
}

/// Draw an identity whose display id is free in `table`
///
/// A taken display id means the uuid's low 32 bits collide with an existing
/// row; a fresh uuid is drawn, up to `attempts` times.
pub fn allocate_identity(
    conn: &Connection,
    table: Table,
    attempts: u32,
) -> SqliteResult<RecordIdentity> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE display_id = ?1)",
        table.name()
    );
    for attempt in 1..=attempts.max(1) {
        let identity = RecordIdentity::generate();
        let taken: bool = conn.query_row(&sql, [identity.display_id.as_str()], |row| row.get(0))?;
        if !taken {
            return Ok(identity);
        }
        warn!(
            table = table.name(),
            display_id = %identity.display_id,
            attempt,
            "Display id collision, drawing a new uuid"
        );
    }
    Err(SqliteError::Graph(kindred_core::GraphError::persistence(format!(
        "could not allocate a free display id in {} after {} attempts",
        table.name(),
        attempts
    ))))
}

/// Resolve a uuid or display id to the row's uuid
pub fn resolve_ref(conn: &Connection, table: Table, id: &RecordRef) -> SqliteResult<Option<Uuid>> {
    let (column, value) = match id {
        RecordRef::Uuid(uuid) => ("uuid", uuid.to_string()),
        RecordRef::Display(display) => ("display_id", display.as_str().to_string()),
    };
    let sql = format!("SELECT uuid FROM {} WHERE {} = ?1", table.name(), column);
    let raw: Option<String> = conn
        .query_row(&sql, [value], |row| row.get(0))
        .optional()?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| SqliteError::Serialization(e.to_string())))
        .transpose()
}

/// Like [`resolve_ref`], failing with not-found
pub fn require_ref(conn: &Connection, table: Table, id: &RecordRef) -> SqliteResult<Uuid> {
    resolve_ref(conn, table, id)?.ok_or_else(|| SqliteError::not_found(table.kind(), id))
}
