//! Row mapping
//!
//! Column lists and `row_to_*` converters for every table. Column order in
//! each `*_COLUMNS` constant matches the indices its converter reads.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use kindred_core::{
    Collection, CollectionCounts, CollectionEntity, CollectionRelationship, DisplayId, Document,
    EntityLink, EntityOperation, GraphEntity, GraphError, GraphRelationship, VisibilityProfile,
};
use rusqlite::types::Type;
use rusqlite::Row;
use serde_json::Value;
use uuid::Uuid;

/// Current time at storage precision
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Storage form of a timestamp
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

pub fn opt_uuid(uuid: &Option<Uuid>) -> Option<String> {
    uuid.as_ref().map(Uuid::to_string)
}

pub fn opt_json(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e))
}

pub fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

pub fn get_display_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<DisplayId> {
    let raw: String = row.get(idx)?;
    DisplayId::parse(&raw).map_err(|e| conversion(idx, e))
}

pub fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

pub fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

pub fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = GraphError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

pub fn get_opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = GraphError>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion(idx, e)))
        .transpose()
}

pub fn get_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn get_json_vec<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<T>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

/// Extension trait for optional query results
pub trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Documents and collections
// ============================================================================

pub const DOCUMENT_COLUMNS: &str = "uuid, display_id, title, filename, owner, content_hash, \
     extraction_status, extraction_error, created_at, updated_at";

pub fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        title: row.get(2)?,
        filename: row.get(3)?,
        owner: row.get(4)?,
        content_hash: row.get(5)?,
        extraction_status: get_parsed(row, 6)?,
        extraction_error: row.get(7)?,
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

pub const COLLECTION_COLUMNS: &str = "uuid, display_id, name, description, owner, parent_uuid, \
     graph_state, entities_hash, last_sync_timestamp, is_graph_generated, graph_generated_at, \
     entity_count, relationship_count, document_count, default_visibility_profile_uuid, \
     created_at, updated_at";

pub fn row_to_collection(row: &Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        owner: row.get(4)?,
        parent_uuid: get_opt_uuid(row, 5)?,
        graph_state: get_parsed(row, 6)?,
        entities_hash: row.get(7)?,
        last_sync_timestamp: get_opt_ts(row, 8)?,
        is_graph_generated: row.get(9)?,
        graph_generated_at: get_opt_ts(row, 10)?,
        counts: CollectionCounts {
            entity_count: row.get(11)?,
            relationship_count: row.get(12)?,
            document_count: row.get(13)?,
        },
        default_visibility_profile_uuid: get_opt_uuid(row, 14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

// ============================================================================
// Graph rows
// ============================================================================

pub const GRAPH_ENTITY_COLUMNS: &str = "uuid, display_id, entity_id, entity_type, name, \
     description, properties, source_type, source_file_uuid, source_collection_uuid, \
     created_by_tool, is_active, created_at, updated_at";

pub fn row_to_graph_entity(row: &Row<'_>) -> rusqlite::Result<GraphEntity> {
    Ok(GraphEntity {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        entity_id: row.get(2)?,
        entity_type: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        properties: get_json(row, 6)?,
        source_type: get_opt_parsed(row, 7)?,
        source_file_uuid: get_opt_uuid(row, 8)?,
        source_collection_uuid: get_opt_uuid(row, 9)?,
        created_by_tool: row.get(10)?,
        is_active: row.get(11)?,
        created_at: get_ts(row, 12)?,
        updated_at: get_ts(row, 13)?,
    })
}

pub const GRAPH_RELATIONSHIP_COLUMNS: &str = "uuid, display_id, source_entity_uuid, \
     target_entity_uuid, relationship_id, relationship_type, source_type, source_file_uuid, \
     source_collection_uuid, is_directed, weight, confidence_score, properties, created_by_tool, \
     is_active, created_at, updated_at";

pub fn row_to_graph_relationship(row: &Row<'_>) -> rusqlite::Result<GraphRelationship> {
    Ok(GraphRelationship {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        source_entity_uuid: get_uuid(row, 2)?,
        target_entity_uuid: get_uuid(row, 3)?,
        relationship_id: row.get(4)?,
        relationship_type: row.get(5)?,
        source_type: get_opt_parsed(row, 6)?,
        source_file_uuid: get_opt_uuid(row, 7)?,
        source_collection_uuid: get_opt_uuid(row, 8)?,
        is_directed: row.get(9)?,
        weight: row.get(10)?,
        confidence_score: row.get(11)?,
        properties: get_json(row, 12)?,
        created_by_tool: row.get(13)?,
        is_active: row.get(14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

// ============================================================================
// Collection graph
// ============================================================================

pub const COLLECTION_ENTITY_COLUMNS: &str = "uuid, display_id, collection_uuid, entity_id, \
     entity_type, name, display_name, description, properties, is_merged, \
     created_from_link_uuid, lifecycle_state, operation_lock, operation_locked_at, created_at, \
     updated_at";

pub fn row_to_collection_entity(row: &Row<'_>) -> rusqlite::Result<CollectionEntity> {
    Ok(CollectionEntity {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        collection_uuid: get_uuid(row, 2)?,
        entity_id: row.get(3)?,
        entity_type: row.get(4)?,
        name: row.get(5)?,
        display_name: row.get(6)?,
        description: row.get(7)?,
        properties: get_json(row, 8)?,
        is_merged: row.get(9)?,
        created_from_link_uuid: get_opt_uuid(row, 10)?,
        lifecycle_state: get_parsed(row, 11)?,
        operation_lock: get_opt_uuid(row, 12)?,
        operation_locked_at: get_opt_ts(row, 13)?,
        created_at: get_ts(row, 14)?,
        updated_at: get_ts(row, 15)?,
    })
}

pub const COLLECTION_RELATIONSHIP_COLUMNS: &str = "uuid, display_id, collection_uuid, \
     source_entity_id, target_entity_id, relationship_type, is_directed, description, properties, \
     created_at, updated_at";

pub fn row_to_collection_relationship(row: &Row<'_>) -> rusqlite::Result<CollectionRelationship> {
    Ok(CollectionRelationship {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        collection_uuid: get_uuid(row, 2)?,
        source_entity_id: row.get(3)?,
        target_entity_id: row.get(4)?,
        relationship_type: row.get(5)?,
        is_directed: row.get(6)?,
        description: row.get(7)?,
        properties: get_json(row, 8)?,
        created_at: get_ts(row, 9)?,
        updated_at: get_ts(row, 10)?,
    })
}

// ============================================================================
// Links, ledger, profiles
// ============================================================================

pub const LINK_COLUMNS: &str = "uuid, display_id, collection_uuid, graph_entity_uuid, \
     collection_entity_uuid, entity_type, confidence_score, link_type, is_active, \
     merged_entity_uuid, common_name, description, created_by_tool, created_at, updated_at, seq";

pub fn row_to_link(row: &Row<'_>) -> rusqlite::Result<EntityLink> {
    Ok(EntityLink {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        collection_uuid: get_uuid(row, 2)?,
        graph_entity_uuid: get_opt_uuid(row, 3)?,
        collection_entity_uuid: get_opt_uuid(row, 4)?,
        entity_type: row.get(5)?,
        confidence_score: row.get(6)?,
        link_type: get_opt_parsed(row, 7)?,
        is_active: row.get(8)?,
        merged_entity_uuid: get_opt_uuid(row, 9)?,
        common_name: row.get(10)?,
        description: row.get(11)?,
        created_by_tool: row.get(12)?,
        created_at: get_ts(row, 13)?,
        updated_at: get_ts(row, 14)?,
        sequence: row.get(15)?,
    })
}

pub const OPERATION_COLUMNS: &str = "uuid, display_id, collection_uuid, operation_type, \
     entity_ids, description, payload, performed_by, status, performed_at, completed_at, seq";

pub fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<EntityOperation> {
    Ok(EntityOperation {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        collection_uuid: get_uuid(row, 2)?,
        operation_type: get_parsed(row, 3)?,
        entity_ids: get_json_vec(row, 4)?,
        description: row.get(5)?,
        payload: get_json(row, 6)?.unwrap_or(Value::Null),
        performed_by: row.get(7)?,
        status: get_parsed(row, 8)?,
        performed_at: get_ts(row, 9)?,
        completed_at: get_opt_ts(row, 10)?,
        sequence: row.get(11)?,
    })
}

pub const PROFILE_COLUMNS: &str = "uuid, display_id, name, description, owner, profile_type, \
     file_uuid, collection_uuid, visible_entity_types, visible_relationship_types, \
     hidden_entities, hidden_relationships, auto_include_new, is_active, created_at, updated_at";

pub fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<VisibilityProfile> {
    Ok(VisibilityProfile {
        uuid: get_uuid(row, 0)?,
        display_id: get_display_id(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        owner: row.get(4)?,
        profile_type: get_parsed(row, 5)?,
        file_uuid: get_opt_uuid(row, 6)?,
        collection_uuid: get_opt_uuid(row, 7)?,
        visible_entity_types: get_json_vec(row, 8)?,
        visible_relationship_types: get_json_vec(row, 9)?,
        hidden_entities: get_json_vec(row, 10)?,
        hidden_relationships: get_json_vec(row, 11)?,
        auto_include_new: row.get(12)?,
        is_active: row.get(13)?,
        created_at: get_ts(row, 14)?,
        updated_at: get_ts(row, 15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kindred_core::GraphState;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert!(ts(&earlier) < ts(&later));
        assert!(ts(&later).ends_with('Z'));
    }

    #[test]
    fn test_bad_uuid_is_conversion_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'not-a-uuid'", [], |row| get_uuid(row, 0))
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, _, _)));
    }

    #[test_case("out_of_sync", Some(GraphState::OutOfSync) ; "known state")]
    #[test_case("updating", Some(GraphState::Updating) ; "busy state")]
    #[test_case("OutOfSync", None ; "wrong casing")]
    fn test_parsed_column(raw: &str, expected: Option<GraphState>) {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let parsed = conn.query_row("SELECT ?1", [raw], |row| get_parsed::<GraphState>(row, 0));
        assert_eq!(parsed.ok(), expected);
    }

    proptest! {
        #[test]
        fn prop_text_order_matches_time_order(
            a in 0i64..253_402_300_799_000_000,
            b in 0i64..253_402_300_799_000_000,
        ) {
            let a = Utc.timestamp_micros(a).unwrap();
            let b = Utc.timestamp_micros(b).unwrap();
            prop_assert_eq!(ts(&a).cmp(&ts(&b)), a.cmp(&b));
        }
    }

    #[test]
    fn test_optional_ext() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let none: Option<i64> = conn
            .query_row("SELECT 1 WHERE 0", [], |row| row.get(0))
            .optional()
            .unwrap();
        assert_eq!(none, None);
    }
}
