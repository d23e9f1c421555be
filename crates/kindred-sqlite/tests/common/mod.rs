//! Shared fixtures for kindred-sqlite integration tests

#![allow(dead_code)]

use kindred_core::{
    Collection, CollectionEntity, Document, GraphBatch, GraphEntity, GraphStateMachine,
    GraphStore, NewCollection, NewDocument, NewGraphEntity, NewGraphRelationship,
};
use kindred_sqlite::{queries, SqliteBackend};
use uuid::Uuid;

pub const ACTOR: &str = "ana";

pub fn backend() -> SqliteBackend {
    SqliteBackend::memory().expect("Failed to open in-memory backend")
}

/// Create a document and ingest its graph
pub async fn document(
    backend: &SqliteBackend,
    title: &str,
    entities: Vec<NewGraphEntity>,
    relationships: Vec<NewGraphRelationship>,
) -> Document {
    let doc = backend
        .store
        .create_document(NewDocument::new(title, ACTOR))
        .await
        .unwrap();
    let mut batch = GraphBatch::new("extractor-v1");
    for entity in entities {
        batch = batch.entity(entity);
    }
    for relationship in relationships {
        batch = batch.relationship(relationship);
    }
    backend.store.ingest_graph(doc.uuid, batch).await.unwrap();
    doc
}

pub fn org(entity_id: &str, name: &str) -> NewGraphEntity {
    NewGraphEntity::new(entity_id, "organization", name)
}

pub async fn collection_of(backend: &SqliteBackend, docs: &[&Document]) -> Collection {
    let coll = backend
        .store
        .create_collection(NewCollection::new("Deals", ACTOR))
        .await
        .unwrap();
    for doc in docs {
        backend.store.add_document(coll.uuid, doc.uuid).await.unwrap();
    }
    coll
}

/// Collection over `docs`, initialized
pub async fn initialized(backend: &SqliteBackend, docs: &[&Document]) -> Collection {
    let coll = collection_of(backend, docs).await;
    backend.state.initialize(coll.uuid, ACTOR).await.unwrap().collection
}

/// The graph entity a document extracted under `entity_id`
pub async fn source(backend: &SqliteBackend, doc: &Document, entity_id: &str) -> GraphEntity {
    backend
        .store
        .graph_entities(doc.uuid)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.entity_id == entity_id)
        .unwrap_or_else(|| panic!("no graph entity {}", entity_id))
}

/// Collection entity currently backed by `graph_entity`
pub fn holder(backend: &SqliteBackend, collection: Uuid, graph_entity: Uuid) -> CollectionEntity {
    backend
        .pool
        .with_connection(|conn| {
            let uuid = queries::holder_of(conn, collection, graph_entity)?
                .expect("source is not held");
            queries::require_collection_entity(conn, uuid)
        })
        .unwrap()
}

pub fn junction_rows(backend: &SqliteBackend, collection: Uuid) -> i64 {
    backend
        .pool
        .with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM collection_entity_sources WHERE collection_uuid = ?1",
                [collection.to_string()],
                |row| row.get(0),
            )?)
        })
        .unwrap()
}

pub fn locked(backend: &SqliteBackend, collection: Uuid) -> i64 {
    backend
        .pool
        .with_connection(|conn| queries::locked_entity_count(conn, collection))
        .unwrap()
}

pub fn execute(backend: &SqliteBackend, sql: &str) {
    backend
        .pool
        .with_connection(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .unwrap();
}

pub fn relationship_junction_rows(backend: &SqliteBackend, collection: Uuid) -> i64 {
    backend
        .pool
        .with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM collection_relationship_sources WHERE collection_uuid = ?1",
                [collection.to_string()],
                |row| row.get(0),
            )?)
        })
        .unwrap()
}

pub fn works_at(person: &str, org: &str) -> NewGraphRelationship {
    NewGraphRelationship::new(person, org, "works_at")
}

pub fn person(entity_id: &str, name: &str) -> NewGraphEntity {
    NewGraphEntity::new(entity_id, "person", name)
}
