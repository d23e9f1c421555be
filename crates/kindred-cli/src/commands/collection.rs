use anyhow::Result;
use kindred_core::{GraphStore, NewCollection};

use super::Session;
use crate::cli::CollectionCommands;
use crate::output::{self, emit};

pub async fn execute(session: &Session, cmd: CollectionCommands) -> Result<()> {
    let store = &session.backend.store;
    match cmd {
        CollectionCommands::Create {
            name,
            description,
            parent,
        } => {
            let mut new = NewCollection::new(name, session.actor.as_str());
            new.description = description;
            if let Some(parent) = parent {
                new = new.with_parent(session.collection(&parent).await?.uuid);
            }
            let created = store.create_collection(new).await?;
            emit(session.format, &created, |c| output::collection(c).to_string())
        }
        CollectionCommands::Show { collection } => {
            let current = session.collection(&collection).await?;
            emit(session.format, &current, |c| output::collection(c).to_string())
        }
        CollectionCommands::Add {
            collection,
            document,
        } => {
            let coll = session.collection(&collection).await?;
            let doc = session.document(&document).await?;
            let updated = store.add_document(coll.uuid, doc.uuid).await?;
            emit(session.format, &updated, |c| output::collection(c).to_string())
        }
        CollectionCommands::Remove {
            collection,
            document,
        } => {
            let coll = session.collection(&collection).await?;
            let doc = session.document(&document).await?;
            let updated = store.remove_document(coll.uuid, doc.uuid).await?;
            emit(session.format, &updated, |c| output::collection(c).to_string())
        }
        CollectionCommands::Children { collection } => {
            let coll = session.collection(&collection).await?;
            let children = store.child_collections(coll.uuid).await?;
            emit(session.format, &children, |c| output::collections(c).to_string())
        }
        CollectionCommands::Entities { collection } => {
            let coll = session.collection(&collection).await?;
            let entities = store.collection_entities(coll.uuid).await?;
            emit(session.format, &entities, |e| output::entities(e).to_string())
        }
        CollectionCommands::Relationships { collection } => {
            let coll = session.collection(&collection).await?;
            let relationships = store.collection_relationships(coll.uuid).await?;
            emit(session.format, &relationships, |r| output::relationships(r).to_string())
        }
        CollectionCommands::Sources { entity } => {
            let entity = session.entity(&entity).await?;
            let sources = store.entity_sources(entity.uuid).await?;
            emit(session.format, &sources, |s| output::graph_entities(s).to_string())
        }
    }
}
