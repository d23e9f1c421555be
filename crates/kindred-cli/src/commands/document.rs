use anyhow::{Context, Result};
use kindred_core::{GraphBatch, GraphStore, NewDocument};
use serde_json::json;
use std::path::Path;
use tracing::info;

use super::Session;
use crate::cli::DocCommands;
use crate::output::{self, emit};

pub async fn execute(session: &Session, cmd: DocCommands) -> Result<()> {
    let store = &session.backend.store;
    match cmd {
        DocCommands::Create { title, filename } => {
            let mut new = NewDocument::new(title, session.actor.as_str());
            if let Some(filename) = filename {
                new = new.with_filename(filename);
            }
            let doc = store.create_document(new).await?;
            emit(session.format, &doc, |d| output::document(d).to_string())
        }
        DocCommands::Show { document } => {
            let doc = session.document(&document).await?;
            emit(session.format, &doc, |d| output::document(d).to_string())
        }
        DocCommands::Ingest { document, file } => {
            let doc = session.document(&document).await?;
            let batch = read_batch(&file)?;
            let report = store.ingest_graph(doc.uuid, batch).await?;
            info!(document = %doc.display_id, entities = report.entity_count, "Ingested graph");
            emit(session.format, &report, |r| output::ingest_report(r).to_string())
        }
        DocCommands::Status {
            document,
            status,
            error,
        } => {
            let doc = session.document(&document).await?;
            let doc = store.set_extraction_status(doc.uuid, status, error).await?;
            emit(session.format, &doc, |d| output::document(d).to_string())
        }
        DocCommands::Entities { document } => {
            let doc = session.document(&document).await?;
            let entities = store.graph_entities(doc.uuid).await?;
            emit(session.format, &entities, |e| output::graph_entities(e).to_string())
        }
        DocCommands::Delete { document } => {
            let doc = session.document(&document).await?;
            store.delete_document(doc.uuid).await?;
            emit(
                session.format,
                &json!({ "deleted": doc.uuid, "display_id": doc.display_id }),
                |_| format!("Deleted document {}", doc.display_id),
            )
        }
    }
}

/// Parse an extraction result file
pub fn read_batch(path: &Path) -> Result<GraphBatch> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse graph file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{
                "created_by_tool": "extractor",
                "entities": [
                    {"entity_id": "e1", "entity_type": "organization", "name": "Acme Corp"},
                    {"entity_id": "e2", "entity_type": "person", "name": "Jane Roe"}
                ],
                "relationships": [
                    {"source_entity_id": "e2", "target_entity_id": "e1", "relationship_type": "works_at"}
                ]
            }"#,
        )
        .unwrap();

        let batch = read_batch(&path).unwrap();
        assert_eq!(batch.entities.len(), 2);
        assert!(batch.relationships[0].is_directed);
        batch.validate().unwrap();
    }

    #[test]
    fn test_read_batch_reports_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        let err = read_batch(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
