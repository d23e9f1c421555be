//! Table and JSON rendering for command results

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Table};
use kindred_core::{
    Collection, CollectionEntity, Document, DriftReport, EntityLink, EntityOperation, GraphEntity,
    GraphStatus, IngestReport, ResolvedRelationship, VisibilityProfile,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Print `value` as pretty JSON, or through `render` for tables
pub fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    render: impl FnOnce(&T) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
            println!("{}", json);
        }
        OutputFormat::Table => println!("{}", render(value)),
    }
    Ok(())
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(header.to_vec());
    table
}

fn or_dash(value: Option<impl ToString>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn stamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Two-column field/value table
pub fn fields(rows: Vec<(&str, String)>) -> Table {
    let mut t = table(&["Field", "Value"]);
    for (field, value) in rows {
        t.add_row(vec![field.to_string(), value]);
    }
    t
}

pub fn document(doc: &Document) -> Table {
    fields(vec![
        ("uuid", doc.uuid.to_string()),
        ("display_id", doc.display_id.to_string()),
        ("title", doc.title.clone()),
        ("filename", or_dash(doc.filename.as_ref())),
        ("owner", doc.owner.clone()),
        ("extraction", doc.extraction_status.to_string()),
        ("extraction_error", or_dash(doc.extraction_error.as_ref())),
        ("created_at", stamp(&doc.created_at)),
    ])
}

pub fn ingest_report(report: &IngestReport) -> Table {
    fields(vec![
        ("document", report.document_uuid.to_string()),
        ("entities", report.entity_count.to_string()),
        ("relationships", report.relationship_count.to_string()),
        ("replaced_entities", report.replaced_entities.to_string()),
    ])
}

pub fn collection(c: &Collection) -> Table {
    fields(vec![
        ("uuid", c.uuid.to_string()),
        ("display_id", c.display_id.to_string()),
        ("name", c.name.clone()),
        ("description", or_dash(c.description.as_ref())),
        ("owner", c.owner.clone()),
        ("parent", or_dash(c.parent_uuid)),
        ("graph_state", c.graph_state.to_string()),
        ("documents", c.counts.document_count.to_string()),
        ("entities", c.counts.entity_count.to_string()),
        ("relationships", c.counts.relationship_count.to_string()),
        ("entities_hash", or_dash(c.entities_hash.as_ref())),
        ("last_sync", or_dash(c.last_sync_timestamp.as_ref().map(stamp))),
        ("default_profile", or_dash(c.default_visibility_profile_uuid)),
    ])
}

pub fn collections(items: &[Collection]) -> Table {
    let mut t = table(&["ID", "Name", "Graph state", "Documents", "Entities"]);
    for c in items {
        t.add_row(vec![
            c.display_id.to_string(),
            c.name.clone(),
            c.graph_state.to_string(),
            c.counts.document_count.to_string(),
            c.counts.entity_count.to_string(),
        ]);
    }
    t
}

pub fn graph_status(status: &GraphStatus) -> Table {
    fields(vec![
        ("collection", status.collection_uuid.to_string()),
        ("graph_state", status.graph_state.to_string()),
        ("entities", status.counts.entity_count.to_string()),
        ("relationships", status.counts.relationship_count.to_string()),
        ("documents", status.counts.document_count.to_string()),
        ("locked_entities", status.locked_entities.to_string()),
        ("entities_hash", or_dash(status.entities_hash.as_ref())),
        ("last_sync", or_dash(status.last_sync_timestamp.as_ref().map(stamp))),
    ])
}

pub fn drift(report: &DriftReport) -> Table {
    fields(vec![
        ("collection", report.collection.display_id.to_string()),
        ("drifted", report.drifted.to_string()),
        ("graph_state", report.collection.graph_state.to_string()),
        ("stored_hash", or_dash(report.stored_hash.as_ref())),
        ("current_hash", report.current_hash.clone()),
    ])
}

pub fn graph_entities(items: &[GraphEntity]) -> Table {
    let mut t = table(&["ID", "Entity id", "Type", "Name", "Tool"]);
    for e in items {
        t.add_row(vec![
            e.display_id.to_string(),
            e.entity_id.clone(),
            e.entity_type.clone(),
            e.name.clone(),
            e.created_by_tool.clone(),
        ]);
    }
    t
}

pub fn entities(items: &[CollectionEntity]) -> Table {
    let mut t = table(&["ID", "Entity id", "Type", "Name", "Merged", "Lifecycle", "Lock"]);
    for e in items {
        t.add_row(vec![
            e.display_id.to_string(),
            e.entity_id.clone(),
            e.entity_type.clone(),
            e.label().to_string(),
            e.is_merged.to_string(),
            e.lifecycle_state.to_string(),
            or_dash(e.operation_lock),
        ]);
    }
    t
}

pub fn relationships(items: &[ResolvedRelationship]) -> Table {
    let mut t = table(&["ID", "Source", "Type", "Target", "Sources"]);
    for r in items {
        t.add_row(vec![
            r.relationship.display_id.to_string(),
            r.source.label().to_string(),
            r.relationship.relationship_type.clone(),
            r.target.label().to_string(),
            r.source_count.to_string(),
        ]);
    }
    t
}

pub fn operations(items: &[EntityOperation]) -> Table {
    let mut t = table(&["ID", "Type", "Status", "By", "At", "Entities", "Error"]);
    for op in items {
        t.add_row(vec![
            op.display_id.to_string(),
            op.operation_type.to_string(),
            op.status.to_string(),
            op.performed_by.clone(),
            stamp(&op.performed_at),
            op.entity_ids.len().to_string(),
            or_dash(op.error()),
        ]);
    }
    t
}

pub fn links(items: &[EntityLink]) -> Table {
    let mut t = table(&["ID", "Graph entity", "Target", "Type", "Confidence", "Active", "Merged into"]);
    for l in items {
        t.add_row(vec![
            l.display_id.to_string(),
            or_dash(l.graph_entity_uuid),
            or_dash(l.collection_entity_uuid),
            or_dash(l.link_type),
            or_dash(l.confidence_score),
            l.is_active.to_string(),
            or_dash(l.merged_entity_uuid),
        ]);
    }
    t
}

pub fn profiles(items: &[VisibilityProfile]) -> Table {
    let mut t = table(&["ID", "Name", "Scope", "Entity types", "Hidden", "Active"]);
    for p in items {
        let types = if p.visible_entity_types.is_empty() {
            "all".to_string()
        } else {
            p.visible_entity_types.join(", ")
        };
        t.add_row(vec![
            p.display_id.to_string(),
            p.name.clone(),
            p.profile_type.to_string(),
            types,
            (p.hidden_entities.len() + p.hidden_relationships.len()).to_string(),
            p.is_active.to_string(),
        ]);
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kindred_core::{CollectionCounts, GraphState, RecordIdentity};

    fn sample_collection() -> Collection {
        let identity = RecordIdentity::generate();
        Collection {
            uuid: identity.uuid,
            display_id: identity.display_id,
            name: "Vendors".to_string(),
            description: None,
            owner: "ana".to_string(),
            parent_uuid: None,
            graph_state: GraphState::OutOfSync,
            entities_hash: None,
            last_sync_timestamp: None,
            is_graph_generated: true,
            graph_generated_at: None,
            counts: CollectionCounts {
                entity_count: 3,
                relationship_count: 1,
                document_count: 2,
            },
            default_visibility_profile_uuid: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_collection_table_shows_state_and_counts() {
        let rendered = collection(&sample_collection()).to_string();
        assert!(rendered.contains("Vendors"));
        assert!(rendered.contains("out_of_sync"));
        assert!(rendered.contains("graph_state"));
    }

    #[test]
    fn test_collections_table_has_a_row_per_collection() {
        let items = vec![sample_collection(), sample_collection()];
        let rendered = collections(&items).to_string();
        for c in &items {
            assert!(rendered.contains(c.display_id.as_str()));
        }
    }

    #[test]
    fn test_missing_values_render_as_dash() {
        assert_eq!(or_dash(None::<String>), "-");
        assert_eq!(or_dash(Some(42)), "42");
    }
}
