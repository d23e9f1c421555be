//! Integration tests for the collection graph state machine, the ledger and
//! lock maintenance

mod common;

use chrono::Duration;
use common::*;
use kindred_core::{
    EngineConfig, GraphState, GraphStateMachine, GraphStore, HistoryQuery, LifecycleState, LockMaintenance,
    MergeEngine, MergeRequest, NewOperation, OperationLedger, OperationStatus, OperationType,
};
use kindred_sqlite::{SqliteBackend, SqliteConfig};
use tempfile::TempDir;

#[tokio::test]
async fn test_sync_while_updating_conflicts() {
    let backend = backend();
    let doc = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
    let coll = initialized(&backend, &[&doc]).await;
    execute(
        &backend,
        &format!(
            "UPDATE collections SET graph_state = 'updating' WHERE uuid = '{}'",
            coll.uuid
        ),
    );

    let err = backend.state.sync(coll.uuid, ACTOR).await.unwrap_err();
    assert!(err.is_retryable(), "{}", err);
    let status = backend.state.graph_status(coll.uuid).await.unwrap();
    assert_eq!(status.graph_state, GraphState::Updating);

    let e1 = source(&backend, &doc, "e1").await;
    let err = backend
        .merges
        .merge(MergeRequest::new(coll.uuid, [e1.uuid], ACTOR).into_target(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn test_initialize_only_once_and_waits_for_extraction() {
    let backend = backend();
    let pending = backend
        .store
        .create_document(kindred_core::NewDocument::new("Still extracting", ACTOR))
        .await
        .unwrap();
    let coll = collection_of(&backend, &[&pending]).await;

    let err = backend.state.initialize(coll.uuid, ACTOR).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    let status = backend.state.graph_status(coll.uuid).await.unwrap();
    assert_eq!(status.graph_state, GraphState::Uninitialized);

    backend
        .store
        .set_extraction_status(
            pending.uuid,
            kindred_core::ExtractionStatus::Error,
            Some("parser crashed".to_string()),
        )
        .await
        .unwrap();
    let outcome = backend.state.initialize(coll.uuid, ACTOR).await.unwrap();
    assert_eq!(outcome.collection.graph_state, GraphState::Synchronized);
    assert!(outcome.collection.is_graph_generated);

    let err = backend.state.initialize(coll.uuid, ACTOR).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn test_drift_then_sync_adds_new_sources() {
    let backend = backend();
    let doc_a = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
    let coll = initialized(&backend, &[&doc_a]).await;

    let clean = backend.state.detect_drift(coll.uuid, ACTOR).await.unwrap();
    assert!(!clean.drifted);
    assert!(clean.operation.is_none());

    let doc_b = document(&backend, "B", vec![org("e2", "ACME Corporation")], vec![]).await;
    backend.store.add_document(coll.uuid, doc_b.uuid).await.unwrap();

    let drift = backend.state.detect_drift(coll.uuid, ACTOR).await.unwrap();
    assert!(drift.drifted);
    assert_eq!(drift.collection.graph_state, GraphState::OutOfSync);
    assert_eq!(
        drift.operation.as_ref().map(|op| op.operation_type),
        Some(OperationType::DriftDetected)
    );

    let synced = backend.state.sync(coll.uuid, ACTOR).await.unwrap();
    assert_eq!(synced.collection.graph_state, GraphState::Synchronized);
    assert_eq!(synced.collection.counts.entity_count, 2);
    assert_eq!(synced.collection.entities_hash.as_deref(), Some(drift.current_hash.as_str()));
    assert!(synced.collection.last_sync_timestamp.is_some());

    let again = backend.state.detect_drift(coll.uuid, ACTOR).await.unwrap();
    assert!(!again.drifted);

    // Sync is not allowed from a synchronized graph
    let err = backend.state.sync(coll.uuid, ACTOR).await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    let history = backend
        .ledger
        .history(HistoryQuery::for_collection(coll.uuid))
        .await
        .unwrap();
    let kinds: Vec<_> = history.iter().map(|op| op.operation_type).collect();
    assert_eq!(
        kinds,
        vec![
            OperationType::InitializeGraph,
            OperationType::DriftDetected,
            OperationType::SyncGraph
        ]
    );
    assert!(history.windows(2).all(|w| w[0].performed_at <= w[1].performed_at));

    let limited = backend
        .ledger
        .history(HistoryQuery::for_collection(coll.uuid).limit(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].operation_type, OperationType::SyncGraph);
}

#[tokio::test]
async fn test_sync_detects_corruption() {
    let backend = backend();
    let doc_a = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
    let coll = initialized(&backend, &[&doc_a]).await;
    let e1 = source(&backend, &doc_a, "e1").await;
    let entity = holder(&backend, coll.uuid, e1.uuid);

    // An entity stuck mid-merge without anyone holding its lock
    execute(
        &backend,
        &format!(
            "UPDATE collection_entities SET lifecycle_state = 'merging' WHERE uuid = '{}'",
            entity.uuid
        ),
    );
    let doc_b = document(&backend, "B", vec![org("e2", "ACME")], vec![]).await;
    backend.store.add_document(coll.uuid, doc_b.uuid).await.unwrap();
    backend.state.detect_drift(coll.uuid, ACTOR).await.unwrap();

    let err = backend.state.sync(coll.uuid, ACTOR).await.unwrap_err();
    assert_eq!(err.kind(), "state_corruption");
    assert!(err.is_alert());

    let status = backend.state.graph_status(coll.uuid).await.unwrap();
    assert_eq!(status.graph_state, GraphState::Error);
    let failed = backend
        .ledger
        .history(HistoryQuery::for_collection(coll.uuid).status(OperationStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].operation_type, OperationType::SyncGraph);
}

#[tokio::test]
async fn test_force_release_of_stale_lock() {
    let backend = backend();
    let doc_a = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
    let doc_b = document(&backend, "B", vec![org("e2", "ACME Corporation")], vec![]).await;
    let coll = initialized(&backend, &[&doc_a, &doc_b]).await;
    let e1 = source(&backend, &doc_a, "e1").await;
    let entity = holder(&backend, coll.uuid, e1.uuid);

    // A merge whose worker died after claiming its entity
    let owner = backend
        .ledger
        .record(NewOperation::new(coll.uuid, OperationType::Merged, "worker").with_entities([entity.uuid]))
        .await
        .unwrap();
    let owner = backend.ledger.mark_in_progress(owner.uuid).await.unwrap();
    execute(
        &backend,
        &format!(
            "UPDATE collection_entities
             SET operation_lock = '{}', operation_locked_at = '2020-01-01T00:00:00.000000Z',
                 lifecycle_state = 'merging'
             WHERE uuid = '{}'",
            owner.uuid, entity.uuid
        ),
    );

    let err = backend
        .merges
        .merge(MergeRequest::new(coll.uuid, [e1.uuid, source(&backend, &doc_b, "e2").await.uuid], ACTOR))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let stale = backend.locks.stale_locks(None).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].uuid, entity.uuid);
    assert!(backend
        .locks
        .stale_locks(Some(Duration::days(365 * 100)))
        .await
        .unwrap()
        .is_empty());

    let released = backend
        .locks
        .force_release(entity.uuid, "ops", "worker lost")
        .await
        .unwrap();
    assert!(released.entity.operation_lock.is_none());
    assert_eq!(released.entity.lifecycle_state, LifecycleState::Error);
    assert_eq!(released.owner.as_ref().map(|op| op.status), Some(OperationStatus::Failed));
    assert_eq!(released.operation.operation_type, OperationType::ForceUnlock);
    assert_eq!(released.operation.status, OperationStatus::Failed);
    assert_eq!(released.operation.error(), Some("worker lost"));
    assert_eq!(locked(&backend, coll.uuid), 0);
}

#[tokio::test]
async fn test_document_deletion_demotes_and_unsyncs() {
    let backend = backend();
    let doc_a = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
    let doc_b = document(&backend, "B", vec![org("e2", "ACME Corporation")], vec![]).await;
    let coll = initialized(&backend, &[&doc_a, &doc_b]).await;
    let e1 = source(&backend, &doc_a, "e1").await;
    let e2 = source(&backend, &doc_b, "e2").await;
    let merged = backend
        .merges
        .merge(MergeRequest::new(coll.uuid, [e1.uuid, e2.uuid], ACTOR))
        .await
        .unwrap()
        .entity;

    backend.store.delete_document(doc_b.uuid).await.unwrap();

    let remaining = holder(&backend, coll.uuid, e1.uuid);
    assert_eq!(remaining.uuid, merged.uuid);
    assert!(!remaining.is_merged);
    assert_eq!(remaining.lifecycle_state, LifecycleState::Individual);
    assert_eq!(junction_rows(&backend, coll.uuid), 1);

    let current = backend.store.get_collection(&coll.uuid.into()).await.unwrap().unwrap();
    assert_eq!(current.graph_state, GraphState::OutOfSync);
    assert_eq!(current.counts.document_count, 1);
    assert_eq!(current.counts.entity_count, 1);

    let history = backend
        .ledger
        .history(HistoryQuery::for_collection(coll.uuid))
        .await
        .unwrap();
    let deleted = history.last().unwrap();
    assert_eq!(deleted.operation_type, OperationType::Deleted);
    assert_eq!(deleted.performed_by, "system");
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kindred.db");
    let open = || {
        kindred_sqlite::SqliteBackend::open(
            kindred_sqlite::SqliteConfig::new(&path),
            kindred_core::EngineConfig::default(),
        )
        .unwrap()
    };

    let coll = {
        let backend = open();
        let doc = document(&backend, "A", vec![org("e1", "Acme Corp")], vec![]).await;
        initialized(&backend, &[&doc]).await
    };

    let backend = open();
    let status = backend.state.graph_status(coll.uuid).await.unwrap();
    assert_eq!(status.graph_state, GraphState::Synchronized);
    assert_eq!(status.counts.entity_count, 1);
    let by_display = backend
        .store
        .get_collection(&coll.display_id.clone().into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_display.uuid, coll.uuid);
}

#[tokio::test]
async fn test_stale_lock_threshold_out_of_range() {
    let backend = backend();
    for threshold in [Duration::seconds(9_000_000_000_000), Duration::seconds(-5)] {
        let err = backend.locks.stale_locks(Some(threshold)).await.unwrap_err();
        assert_eq!(err.kind(), "validation", "{:?}", threshold);
        assert!(!err.is_alert());
    }

    let config = EngineConfig {
        stale_lock_after_secs: u64::MAX,
        ..EngineConfig::default()
    };
    let backend = SqliteBackend::open(SqliteConfig::memory(), config).unwrap();
    let err = backend.locks.stale_locks(None).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}
