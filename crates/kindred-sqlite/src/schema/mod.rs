//! Schema management and migrations

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{SqliteError, SqliteResult};

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 1;

/// Apply all pending migrations
pub fn apply_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version = get_current_version(conn)?;
    debug!(current_version, target_version = SCHEMA_VERSION, "Checking migrations");

    if current_version < 1 {
        info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Applying schema migrations"
        );
        apply_migration_v1(conn)?;
    }

    Ok(())
}

/// Get current schema version
fn get_current_version(conn: &Connection) -> SqliteResult<i32> {
    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

fn record_migration(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("INSERT INTO schema_migrations (version) VALUES (?)", [version])?;
    Ok(())
}

/// Migration v1: documents, collections, graph rows, merge views, ledger
fn apply_migration_v1(conn: &Connection) -> SqliteResult<()> {
    debug!("Applying migration v1: collection graph schema");

    conn.execute_batch(SCHEMA_V1)
        .map_err(|e| SqliteError::Schema(format!("Failed to apply v1 schema: {}", e)))?;

    record_migration(conn, 1)?;
    info!("Migration v1 applied successfully");
    Ok(())
}

/// Initial schema SQL
///
/// Timestamps are RFC 3339 UTC strings with microsecond precision, so text
/// order is time order. Uuids are stored hyphenated.
const SCHEMA_V1: &str = r#"
-- ============================================================================
-- TABLE: documents
-- ============================================================================

CREATE TABLE IF NOT EXISTS documents (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
    filename TEXT,
    owner TEXT NOT NULL,
    content_hash TEXT,
    extraction_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (extraction_status IN ('pending', 'processing', 'complete', 'error')),
    extraction_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- ============================================================================
-- TABLE: collections
-- ============================================================================

CREATE TABLE IF NOT EXISTS collections (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    name TEXT NOT NULL CHECK (length(trim(name)) > 0),
    description TEXT,
    owner TEXT NOT NULL,
    parent_uuid TEXT REFERENCES collections(uuid) ON DELETE SET NULL,
    graph_state TEXT NOT NULL DEFAULT 'uninitialized'
        CHECK (graph_state IN ('uninitialized', 'initializing', 'synchronized',
                               'out_of_sync', 'updating', 'error')),
    entities_hash TEXT,
    last_sync_timestamp TEXT,
    is_graph_generated INTEGER NOT NULL DEFAULT 0,
    graph_generated_at TEXT,
    entity_count INTEGER NOT NULL DEFAULT 0 CHECK (entity_count >= 0),
    relationship_count INTEGER NOT NULL DEFAULT 0 CHECK (relationship_count >= 0),
    document_count INTEGER NOT NULL DEFAULT 0 CHECK (document_count >= 0),
    default_visibility_profile_uuid TEXT
        REFERENCES visibility_profiles(uuid) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (parent_uuid IS NULL OR parent_uuid != uuid)
);

CREATE INDEX IF NOT EXISTS idx_collections_parent ON collections(parent_uuid);

CREATE TABLE IF NOT EXISTS collection_documents (
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    document_uuid TEXT NOT NULL REFERENCES documents(uuid) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (collection_uuid, document_uuid)
);

CREATE INDEX IF NOT EXISTS idx_collection_documents_document
    ON collection_documents(document_uuid);

-- ============================================================================
-- TABLE: graph_entities / graph_relationships
-- ============================================================================
-- Facts extracted per source; never merged in place

CREATE TABLE IF NOT EXISTS graph_entities (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    entity_id TEXT NOT NULL CHECK (length(trim(entity_id)) > 0),
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    properties TEXT,  -- JSON
    source_type TEXT CHECK (source_type IS NULL OR source_type IN
        ('file', 'collection_generated', 'document')),
    source_file_uuid TEXT REFERENCES documents(uuid) ON DELETE CASCADE,
    source_collection_uuid TEXT REFERENCES collections(uuid) ON DELETE CASCADE,
    created_by_tool TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (source_file_uuid IS NOT NULL OR source_collection_uuid IS NOT NULL)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_entities_source_entity
    ON graph_entities(COALESCE(source_file_uuid, source_collection_uuid), entity_id);
CREATE INDEX IF NOT EXISTS idx_graph_entities_file ON graph_entities(source_file_uuid);
CREATE INDEX IF NOT EXISTS idx_graph_entities_collection
    ON graph_entities(source_collection_uuid);

CREATE TABLE IF NOT EXISTS graph_relationships (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    source_entity_uuid TEXT NOT NULL REFERENCES graph_entities(uuid) ON DELETE CASCADE,
    target_entity_uuid TEXT NOT NULL REFERENCES graph_entities(uuid) ON DELETE CASCADE,
    relationship_id TEXT,
    relationship_type TEXT NOT NULL CHECK (length(trim(relationship_type)) > 0),
    source_type TEXT CHECK (source_type IS NULL OR source_type IN
        ('file', 'collection_generated', 'document')),
    source_file_uuid TEXT REFERENCES documents(uuid) ON DELETE CASCADE,
    source_collection_uuid TEXT REFERENCES collections(uuid) ON DELETE CASCADE,
    is_directed INTEGER NOT NULL DEFAULT 1,
    weight REAL CHECK (weight IS NULL OR weight > 0),
    confidence_score REAL CHECK (confidence_score IS NULL
        OR (confidence_score >= 0 AND confidence_score <= 1)),
    properties TEXT,  -- JSON
    created_by_tool TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (source_file_uuid IS NOT NULL OR source_collection_uuid IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_graph_relationships_source
    ON graph_relationships(source_entity_uuid);
CREATE INDEX IF NOT EXISTS idx_graph_relationships_target
    ON graph_relationships(target_entity_uuid);
CREATE INDEX IF NOT EXISTS idx_graph_relationships_file
    ON graph_relationships(source_file_uuid);

-- ============================================================================
-- TABLE: collection_entities / collection_entity_sources
-- ============================================================================
-- Merged view; sources through the junction, never through arrays

CREATE TABLE IF NOT EXISTS collection_entities (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL,
    display_name TEXT,
    description TEXT,
    properties TEXT,  -- JSON
    is_merged INTEGER NOT NULL DEFAULT 0,
    created_from_link_uuid TEXT REFERENCES entity_links(uuid) ON DELETE SET NULL,
    lifecycle_state TEXT NOT NULL DEFAULT 'individual'
        CHECK (lifecycle_state IN ('individual', 'linked', 'merging', 'merged',
                                   'unmerging', 'error')),
    operation_lock TEXT REFERENCES entity_operations(uuid),
    operation_locked_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (collection_uuid, entity_id),
    CHECK ((operation_lock IS NULL) = (operation_locked_at IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_collection_entities_lock
    ON collection_entities(operation_locked_at) WHERE operation_lock IS NOT NULL;

CREATE TABLE IF NOT EXISTS collection_entity_sources (
    collection_entity_uuid TEXT NOT NULL
        REFERENCES collection_entities(uuid) ON DELETE CASCADE,
    graph_entity_uuid TEXT NOT NULL REFERENCES graph_entities(uuid) ON DELETE CASCADE,
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (collection_entity_uuid, graph_entity_uuid),
    -- a source backs at most one entity per collection
    UNIQUE (collection_uuid, graph_entity_uuid)
);

CREATE INDEX IF NOT EXISTS idx_collection_entity_sources_graph
    ON collection_entity_sources(graph_entity_uuid);

-- ============================================================================
-- TABLE: collection_relationships / collection_relationship_sources
-- ============================================================================

CREATE TABLE IF NOT EXISTS collection_relationships (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    source_entity_id TEXT NOT NULL,  -- logical id
    target_entity_id TEXT NOT NULL,  -- logical id
    relationship_type TEXT NOT NULL,
    -- undirected edges store their endpoints in ascending order
    is_directed INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    properties TEXT,  -- JSON
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (collection_uuid, source_entity_id, target_entity_id, relationship_type, is_directed),
    CHECK (is_directed = 1 OR source_entity_id <= target_entity_id)
);

CREATE TABLE IF NOT EXISTS collection_relationship_sources (
    collection_relationship_uuid TEXT NOT NULL
        REFERENCES collection_relationships(uuid) ON DELETE CASCADE,
    graph_relationship_uuid TEXT NOT NULL
        REFERENCES graph_relationships(uuid) ON DELETE CASCADE,
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (collection_relationship_uuid, graph_relationship_uuid),
    UNIQUE (collection_uuid, graph_relationship_uuid)
);

-- ============================================================================
-- TABLE: entity_links
-- ============================================================================

CREATE TABLE IF NOT EXISTS entity_links (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    seq INTEGER NOT NULL UNIQUE,
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid) ON DELETE CASCADE,
    graph_entity_uuid TEXT REFERENCES graph_entities(uuid) ON DELETE CASCADE,
    collection_entity_uuid TEXT REFERENCES collection_entities(uuid) ON DELETE SET NULL,
    entity_type TEXT,
    confidence_score INTEGER CHECK (confidence_score IS NULL
        OR (confidence_score >= 0 AND confidence_score <= 100)),
    link_type TEXT CHECK (link_type IS NULL
        OR link_type IN ('exact_match', 'fuzzy_match', 'manual')),
    is_active INTEGER NOT NULL DEFAULT 1,
    merged_entity_uuid TEXT REFERENCES collection_entities(uuid) ON DELETE SET NULL,
    common_name TEXT,
    description TEXT,
    created_by_tool TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_links_target
    ON entity_links(collection_entity_uuid, is_active);
CREATE INDEX IF NOT EXISTS idx_entity_links_source
    ON entity_links(collection_uuid, graph_entity_uuid);

-- ============================================================================
-- TABLE: entity_operations
-- ============================================================================
-- Append-only ledger. Terminal rows are frozen and nothing is ever deleted.

CREATE TABLE IF NOT EXISTS entity_operations (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    seq INTEGER NOT NULL UNIQUE,
    collection_uuid TEXT NOT NULL REFERENCES collections(uuid),
    operation_type TEXT NOT NULL CHECK (operation_type IN (
        'created', 'merged', 'split', 'deleted', 'updated', 'unmerged', 'link',
        'unlink', 'initialize_graph', 'sync_graph', 'drift_detected', 'force_unlock')),
    entity_ids TEXT NOT NULL DEFAULT '[]',  -- JSON array of uuids
    description TEXT,
    payload TEXT NOT NULL DEFAULT '{}',  -- JSON object
    performed_by TEXT NOT NULL CHECK (length(trim(performed_by)) > 0),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
    performed_at TEXT NOT NULL,
    completed_at TEXT,
    CHECK ((status IN ('completed', 'failed')) = (completed_at IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_entity_operations_history
    ON entity_operations(collection_uuid, performed_at, seq);

CREATE TRIGGER IF NOT EXISTS entity_operations_terminal_frozen
BEFORE UPDATE ON entity_operations
WHEN OLD.status IN ('completed', 'failed')
BEGIN
    SELECT RAISE(ABORT, 'terminal operation records are immutable');
END;

CREATE TRIGGER IF NOT EXISTS entity_operations_append_only
BEFORE DELETE ON entity_operations
BEGIN
    SELECT RAISE(ABORT, 'operation records are never deleted');
END;

-- ============================================================================
-- TABLE: visibility_profiles
-- ============================================================================

CREATE TABLE IF NOT EXISTS visibility_profiles (
    uuid TEXT PRIMARY KEY NOT NULL,
    display_id TEXT NOT NULL UNIQUE CHECK (length(display_id) = 8),
    name TEXT NOT NULL CHECK (length(trim(name)) > 0),
    description TEXT,
    owner TEXT NOT NULL,
    profile_type TEXT NOT NULL CHECK (profile_type IN ('FILE', 'COLLECTION', 'GLOBAL')),
    file_uuid TEXT REFERENCES documents(uuid) ON DELETE CASCADE,
    collection_uuid TEXT REFERENCES collections(uuid) ON DELETE CASCADE,
    visible_entity_types TEXT NOT NULL DEFAULT '[]',  -- JSON
    visible_relationship_types TEXT NOT NULL DEFAULT '[]',
    hidden_entities TEXT NOT NULL DEFAULT '[]',
    hidden_relationships TEXT NOT NULL DEFAULT '[]',
    auto_include_new INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_visibility_profiles_collection
    ON visibility_profiles(collection_uuid);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_schema_creates_junction_tables() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        let tables = tables(&conn);
        for expected in [
            "collection_documents",
            "collection_entities",
            "collection_entity_sources",
            "collection_relationship_sources",
            "collection_relationships",
            "collections",
            "documents",
            "entity_links",
            "entity_operations",
            "graph_entities",
            "graph_relationships",
            "visibility_profiles",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_terminal_operations_are_frozen() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO collections (uuid, display_id, name, owner, created_at, updated_at)
                 VALUES ('c', 'aaaaaaaa', 'Research', 'user:alice', 't', 't');
             INSERT INTO entity_operations
                 (uuid, display_id, seq, collection_uuid, operation_type, performed_by,
                  status, performed_at, completed_at)
                 VALUES ('o', 'bbbbbbbb', 1, 'c', 'merged', 'user:alice', 'completed', 't', 't');",
        )
        .unwrap();

        let update = conn.execute("UPDATE entity_operations SET status = 'failed'", []);
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM entity_operations", []);
        assert!(delete.is_err());
    }
}
