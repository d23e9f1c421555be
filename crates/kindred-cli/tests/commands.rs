//! End-to-end runs of the subcommand handlers against an in-memory store

use clap::Parser;
use kindred_cli::cli::Cli;
use kindred_cli::commands::{self, Session};
use kindred_cli::output::OutputFormat;
use kindred_core::{
    GraphState, GraphStore, HistoryQuery, LinkResolver, OperationLedger, OperationType,
    RecordRef,
};
use kindred_sqlite::SqliteBackend;
use tempfile::TempDir;

fn session() -> Session {
    Session::new(SqliteBackend::memory().unwrap(), "ana", OutputFormat::Json, 100)
}

async fn run(session: &Session, args: &[&str]) -> anyhow::Result<()> {
    let cli = Cli::try_parse_from(std::iter::once("kindred").chain(args.iter().copied()))?;
    commands::execute(session, cli.command).await
}

fn write_graph(dir: &TempDir, name: &str, entity_id: &str, entity_name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(
        &path,
        serde_json::json!({
            "created_by_tool": "extractor",
            "entities": [
                {"entity_id": entity_id, "entity_type": "organization", "name": entity_name}
            ]
        })
        .to_string(),
    )
    .unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn test_merge_workflow_through_commands() {
    let session = session();
    let store = &session.backend.store;
    let dir = TempDir::new().unwrap();

    run(&session, &["doc", "create", "Memo A"]).await.unwrap();
    run(&session, &["doc", "create", "Memo B", "--filename", "b.pdf"]).await.unwrap();
    run(&session, &["collection", "create", "Vendors"]).await.unwrap();

    let ids = session.backend.pool.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT display_id FROM documents ORDER BY title")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let coll: String = conn.query_row("SELECT display_id FROM collections", [], |row| row.get(0))?;
        Ok((ids, coll))
    });
    let (docs, coll) = ids.unwrap();

    let graph_a = write_graph(&dir, "a.json", "e1", "Acme Corp");
    let graph_b = write_graph(&dir, "b.json", "e1", "ACME Corporation");
    run(&session, &["doc", "ingest", &docs[0], &graph_a]).await.unwrap();
    run(&session, &["doc", "ingest", &docs[1], &graph_b]).await.unwrap();
    run(&session, &["collection", "add", &coll, &docs[0]]).await.unwrap();
    run(&session, &["collection", "add", &coll, &docs[1]]).await.unwrap();
    run(&session, &["graph", "init", &coll]).await.unwrap();

    let coll_ref: RecordRef = coll.parse().unwrap();
    let collection = store.get_collection(&coll_ref).await.unwrap().unwrap();
    assert_eq!(collection.graph_state, GraphState::Synchronized);
    assert_eq!(collection.counts.entity_count, 2);

    let doc_a = store.get_document(&docs[0].parse().unwrap()).await.unwrap().unwrap();
    let doc_b = store.get_document(&docs[1].parse().unwrap()).await.unwrap().unwrap();
    let e1 = store.graph_entities(doc_a.uuid).await.unwrap().remove(0);
    let e2 = store.graph_entities(doc_b.uuid).await.unwrap().remove(0);

    run(
        &session,
        &[
            "merge",
            &coll,
            e1.display_id.as_str(),
            e2.display_id.as_str(),
            "--name",
            "Acme",
            "--properties",
            r#"{"ticker": "ACME"}"#,
        ],
    )
    .await
    .unwrap();

    let entities = store.collection_entities(collection.uuid).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert!(entities[0].is_merged);
    assert_eq!(entities[0].name, "Acme");

    run(&session, &["unmerge", entities[0].display_id.as_str()]).await.unwrap();
    assert_eq!(store.collection_entities(collection.uuid).await.unwrap().len(), 2);

    run(&session, &["history", &coll]).await.unwrap();
    let ops = session
        .backend
        .ledger
        .history(HistoryQuery::for_collection(collection.uuid))
        .await
        .unwrap();
    let kinds: Vec<_> = ops.iter().map(|op| op.operation_type).collect();
    assert_eq!(
        kinds,
        vec![OperationType::InitializeGraph, OperationType::Merged, OperationType::Unmerged]
    );
    assert!(ops.iter().all(|op| op.performed_by == "ana"));
}

#[tokio::test]
async fn test_link_commands() {
    let session = session();
    let store = &session.backend.store;
    let dir = TempDir::new().unwrap();

    run(&session, &["doc", "create", "Memo A"]).await.unwrap();
    run(&session, &["doc", "create", "Memo B"]).await.unwrap();
    run(&session, &["collection", "create", "Vendors"]).await.unwrap();
    let (docs, coll) = session
        .backend
        .pool
        .with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT display_id FROM documents ORDER BY title")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let coll: String =
                conn.query_row("SELECT display_id FROM collections", [], |row| row.get(0))?;
            Ok((ids, coll))
        })
        .unwrap();
    run(&session, &["doc", "ingest", &docs[0], &write_graph(&dir, "a.json", "e1", "Acme Corp")])
        .await
        .unwrap();
    run(&session, &["doc", "ingest", &docs[1], &write_graph(&dir, "b.json", "e9", "Acme")])
        .await
        .unwrap();
    for doc in &docs {
        run(&session, &["collection", "add", &coll, doc]).await.unwrap();
    }
    run(&session, &["graph", "init", &coll]).await.unwrap();

    let collection = store.get_collection(&coll.parse().unwrap()).await.unwrap().unwrap();
    let doc_a = store.get_document(&docs[0].parse().unwrap()).await.unwrap().unwrap();
    let doc_b = store.get_document(&docs[1].parse().unwrap()).await.unwrap().unwrap();
    let e1 = store.graph_entities(doc_a.uuid).await.unwrap().remove(0);
    let e9 = store.graph_entities(doc_b.uuid).await.unwrap().remove(0);
    let target = store
        .collection_entities(collection.uuid)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.name == "Acme Corp")
        .unwrap();

    run(
        &session,
        &[
            "link",
            "propose",
            &coll,
            e9.display_id.as_str(),
            "--target",
            target.display_id.as_str(),
            "--confidence",
            "87",
            "--type",
            "fuzzy",
        ],
    )
    .await
    .unwrap();

    let best = session
        .backend
        .links
        .best_candidate(collection.uuid, e9.uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(best.confidence_score, Some(87));

    run(&session, &["link", "confirm", best.display_id.as_str()]).await.unwrap();
    let link = session.backend.links.get_link(&best.uuid.into()).await.unwrap().unwrap();
    assert!(link.is_confirmed());
    let entities = store.collection_entities(collection.uuid).await.unwrap();
    assert_eq!(entities.len(), 1);
    let mut sources: Vec<_> = store
        .entity_sources(entities[0].uuid)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.uuid)
        .collect();
    sources.sort();
    let mut expected = vec![e1.uuid, e9.uuid];
    expected.sort();
    assert_eq!(sources, expected);

    // Confirming twice is rejected
    assert!(run(&session, &["link", "confirm", best.display_id.as_str()]).await.is_err());
}

#[tokio::test]
async fn test_unknown_records_are_errors() {
    let session = session();
    let err = run(&session, &["collection", "show", "deadbeef"]).await.unwrap_err();
    assert!(err.to_string().contains("not found"), "{}", err);

    let err = run(&session, &["profile", "default", "deadbeef"]).await.unwrap_err();
    assert!(err.to_string().contains("not found"), "{}", err);
}
