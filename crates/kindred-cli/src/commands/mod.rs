//! Subcommand handlers
//!
//! Each module drives one group of ports on a [`Session`]; `execute` routes a
//! parsed command to its handler.

pub mod collection;
pub mod config;
pub mod document;
pub mod graph;
pub mod link;
pub mod locks;
pub mod merge;
pub mod profile;

use anyhow::{Context, Result};
use kindred_core::{
    Collection, CollectionEntity, Document, EntityLink, GraphEntity, GraphError, GraphStore,
    LinkResolver, RecordRef, VisibilityProfile, VisibilityStore,
};
use kindred_sqlite::SqliteBackend;
use tracing::debug;

use crate::cli::Commands;
use crate::config::KindredConfig;
use crate::output::OutputFormat;

/// An opened store plus the caller's identity and output settings
pub struct Session {
    pub backend: SqliteBackend,
    pub actor: String,
    pub format: OutputFormat,
    pub history_limit: usize,
}

impl Session {
    /// Open the configured database
    pub fn open(config: KindredConfig, format: OutputFormat) -> Result<Self> {
        let actor = config.actor()?;
        if let Some(parent) = config.database.path.parent() {
            if !config.database.is_memory() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }
        debug!(path = %config.database.path.display(), actor = %actor, "Opening store");
        let history_limit = config.engine.default_history_limit;
        let backend = SqliteBackend::open(config.database, config.engine)
            .context("Failed to open database")?;
        Ok(Self::new(backend, actor, format, history_limit))
    }

    pub fn new(
        backend: SqliteBackend,
        actor: impl Into<String>,
        format: OutputFormat,
        history_limit: usize,
    ) -> Self {
        Self {
            backend,
            actor: actor.into(),
            format,
            history_limit,
        }
    }

    pub async fn document(&self, id: &RecordRef) -> Result<Document> {
        found("document", id, self.backend.store.get_document(id).await?)
    }

    pub async fn collection(&self, id: &RecordRef) -> Result<Collection> {
        found("collection", id, self.backend.store.get_collection(id).await?)
    }

    pub async fn graph_entity(&self, id: &RecordRef) -> Result<GraphEntity> {
        found("graph entity", id, self.backend.store.get_graph_entity(id).await?)
    }

    pub async fn entity(&self, id: &RecordRef) -> Result<CollectionEntity> {
        found("collection entity", id, self.backend.store.get_collection_entity(id).await?)
    }

    pub async fn link(&self, id: &RecordRef) -> Result<EntityLink> {
        found("entity link", id, self.backend.links.get_link(id).await?)
    }

    pub async fn profile(&self, id: &RecordRef) -> Result<VisibilityProfile> {
        found("visibility profile", id, self.backend.visibility.get_profile(id).await?)
    }
}

fn found<T>(kind: &'static str, id: &RecordRef, record: Option<T>) -> Result<T> {
    record.ok_or_else(|| GraphError::not_found(kind, id).into())
}

/// Run a store command
///
/// `config` subcommands are handled before a session is opened.
pub async fn execute(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Doc(cmd) => document::execute(session, cmd).await,
        Commands::Collection(cmd) => collection::execute(session, cmd).await,
        Commands::Graph(cmd) => graph::execute(session, cmd).await,
        Commands::Merge {
            collection,
            sources,
            into,
            name,
            description,
            properties,
        } => {
            merge::merge(
                session,
                merge::MergeArgs {
                    collection,
                    sources,
                    into,
                    name,
                    description,
                    properties,
                },
            )
            .await
        }
        Commands::Unmerge { entity } => merge::unmerge(session, &entity).await,
        Commands::Split { entity, parts } => merge::split(session, &entity, &parts).await,
        Commands::Link(cmd) => link::execute(session, cmd).await,
        Commands::History {
            collection,
            limit,
            status,
        } => graph::history(session, &collection, limit, status).await,
        Commands::Locks(cmd) => locks::execute(session, cmd).await,
        Commands::Profile(cmd) => profile::execute(session, cmd).await,
        Commands::Config(_) => anyhow::bail!("config commands do not open a store"),
    }
}
