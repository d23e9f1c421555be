//! VisibilityStore implementation for SQLite

use async_trait::async_trait;
use kindred_core::{
    Collection, EngineConfig, GraphError, GraphResult, GraphView, NewVisibilityProfile,
    ProfileType, RecordRef, VisibilityProfile, VisibilityStore,
};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use crate::ids::{allocate_identity, resolve_ref, Table};
use crate::queries::{
    collection_entities, fetch_profile, query_all, require_collection, require_document,
};
use crate::rows::{now, row_to_profile, ts, PROFILE_COLUMNS};
use crate::store::resolved_relationships;

pub(crate) fn insert_profile(
    conn: &Connection,
    profile: &NewVisibilityProfile,
    attempts: u32,
) -> SqliteResult<VisibilityProfile> {
    profile.validate()?;
    if let Some(file) = profile.file_uuid {
        require_document(conn, file)?;
    }
    if let Some(collection) = profile.collection_uuid {
        require_collection(conn, collection)?;
    }

    let identity = allocate_identity(conn, Table::VisibilityProfiles, attempts)?;
    let stamp = ts(&now());
    conn.execute(
        "INSERT INTO visibility_profiles
             (uuid, display_id, name, description, owner, profile_type, file_uuid,
              collection_uuid, visible_entity_types, visible_relationship_types,
              hidden_entities, hidden_relationships, auto_include_new, is_active,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14, ?14)",
        params![
            identity.uuid.to_string(),
            identity.display_id.as_str(),
            profile.name.trim(),
            profile.description,
            profile.owner,
            profile.profile_type.as_str(),
            profile.file_uuid.map(|u| u.to_string()),
            profile.collection_uuid.map(|u| u.to_string()),
            serde_json::to_string(&profile.visible_entity_types)?,
            serde_json::to_string(&profile.visible_relationship_types)?,
            serde_json::to_string(&profile.hidden_entities)?,
            serde_json::to_string(&profile.hidden_relationships)?,
            profile.auto_include_new,
            stamp,
        ],
    )?;
    info!(
        profile = %identity.display_id,
        profile_type = %profile.profile_type,
        "Created visibility profile"
    );
    fetch_profile(conn, identity.uuid)?
        .ok_or_else(|| SqliteError::not_found("visibility profile", identity.uuid))
}

fn require_profile(conn: &Connection, uuid: Uuid) -> SqliteResult<VisibilityProfile> {
    fetch_profile(conn, uuid)?.ok_or_else(|| SqliteError::not_found("visibility profile", uuid))
}

/// Profiles usable by a collection: its own plus global ones
pub(crate) fn profiles_for(
    conn: &Connection,
    collection: Uuid,
) -> SqliteResult<Vec<VisibilityProfile>> {
    require_collection(conn, collection)?;
    let sql = format!(
        "SELECT {} FROM visibility_profiles
         WHERE (profile_type = 'COLLECTION' AND collection_uuid = ?1) OR profile_type = 'GLOBAL'
         ORDER BY profile_type, name, uuid",
        PROFILE_COLUMNS
    );
    query_all(conn, &sql, [collection.to_string()], row_to_profile)
}

pub(crate) fn set_default(
    conn: &Connection,
    collection: Uuid,
    profile: Option<Uuid>,
) -> SqliteResult<Collection> {
    let current = require_collection(conn, collection)?;
    if let Some(uuid) = profile {
        let profile = require_profile(conn, uuid)?;
        let applies = match profile.profile_type {
            ProfileType::Global => true,
            ProfileType::Collection => profile.collection_uuid == Some(collection),
            ProfileType::File => false,
        };
        if !applies {
            return Err(GraphError::validation(format!(
                "profile {} does not apply to collection {}",
                profile.display_id, current.display_id
            ))
            .into());
        }
        if !profile.is_active {
            return Err(GraphError::validation(format!(
                "profile {} is inactive",
                profile.display_id
            ))
            .into());
        }
    }

    conn.execute(
        "UPDATE collections SET default_visibility_profile_uuid = ?2, updated_at = ?3
         WHERE uuid = ?1",
        params![
            collection.to_string(),
            profile.map(|u| u.to_string()),
            ts(&now())
        ],
    )?;
    debug!(collection = %current.display_id, profile = ?profile, "Set default visibility profile");
    require_collection(conn, collection)
}

pub(crate) fn visible_graph(
    conn: &Connection,
    collection: Uuid,
    profile: Option<Uuid>,
) -> SqliteResult<GraphView> {
    let current = require_collection(conn, collection)?;
    let entities = collection_entities(conn, collection)?;
    let relationships = resolved_relationships(conn, collection)?;

    let applied = match profile {
        Some(uuid) => {
            let profile = require_profile(conn, uuid)?;
            if !profile.is_active {
                return Err(GraphError::validation(format!(
                    "profile {} is inactive",
                    profile.display_id
                ))
                .into());
            }
            Some(profile)
        }
        None => match current.default_visibility_profile_uuid {
            Some(uuid) => match fetch_profile(conn, uuid)? {
                Some(profile) if profile.is_active => Some(profile),
                _ => {
                    warn!(
                        collection = %current.display_id,
                        profile = %uuid,
                        "Default visibility profile is unavailable, showing everything"
                    );
                    None
                }
            },
            None => None,
        },
    };

    let (entities, relationships, profile_uuid) = match applied {
        Some(profile) => {
            let (entities, relationships) = profile.apply(entities, relationships);
            (entities, relationships, Some(profile.uuid))
        }
        None => (entities, relationships, None),
    };
    Ok(GraphView {
        collection_uuid: collection,
        profile_uuid,
        entities,
        relationships,
    })
}

/// SQLite implementation of VisibilityStore
#[derive(Clone)]
pub struct SqliteVisibilityStore {
    pool: SqlitePool,
    config: EngineConfig,
}

impl SqliteVisibilityStore {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl VisibilityStore for SqliteVisibilityStore {
    async fn create_profile(&self, profile: NewVisibilityProfile) -> GraphResult<VisibilityProfile> {
        let attempts = self.config.display_id_attempts;
        self.pool
            .run(move |pool| pool.with_transaction(|tx| insert_profile(tx, &profile, attempts)))
            .await
    }

    async fn get_profile(&self, id: &RecordRef) -> GraphResult<Option<VisibilityProfile>> {
        let id = id.clone();
        self.pool
            .run(move |pool| {
                pool.with_connection(|conn| {
                    match resolve_ref(conn, Table::VisibilityProfiles, &id)? {
                        Some(uuid) => fetch_profile(conn, uuid),
                        None => Ok(None),
                    }
                })
            })
            .await
    }

    async fn collection_profiles(&self, collection: Uuid) -> GraphResult<Vec<VisibilityProfile>> {
        self.pool
            .run(move |pool| pool.with_connection(|conn| profiles_for(conn, collection)))
            .await
    }

    async fn set_default_profile(
        &self,
        collection: Uuid,
        profile: Option<Uuid>,
    ) -> GraphResult<Collection> {
        self.pool
            .run(move |pool| pool.with_transaction(|tx| set_default(tx, collection, profile)))
            .await
    }

    async fn visible_graph(&self, collection: Uuid, profile: Option<Uuid>) -> GraphResult<GraphView> {
        self.pool
            .run(move |pool| pool.with_connection(|conn| visible_graph(conn, collection, profile)))
            .await
    }
}
