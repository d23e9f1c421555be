//! SQLite storage backend for Kindred
//!
//! This crate implements every Kindred port on SQLite: the graph store, the
//! merge engine, link resolution, the operation ledger, the collection graph
//! state machine, lock maintenance and visibility profiles.
//!
//! ## Features
//!
//! - **Phased mutations**: merges, splits and graph rebuilds claim their rows
//!   with conditional updates in one transaction, mutate in another, and
//!   compensate when the mutation fails
//! - **Junction tables**: sources of collection entities and relationships
//!   are rows, never JSON arrays
//! - **WAL Mode**: write-ahead logging for on-disk databases
//! - **Thread Safety**: Arc<Mutex<Connection>> pattern for concurrent access
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kindred_core::{EngineConfig, MergeEngine, MergeRequest};
//! use kindred_sqlite::{SqliteBackend, SqliteConfig};
//!
//! let backend = SqliteBackend::open(SqliteConfig::new("./kindred.db"), EngineConfig::default())?;
//! let outcome = backend
//!     .merges
//!     .merge(MergeRequest::new(collection, [acme, acme_corp], "ana"))
//!     .await?;
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod links;
pub mod locks;
pub mod merge;
pub mod queries;
pub mod reconcile;
pub mod rows;
pub mod schema;
pub mod state;
pub mod store;
pub mod visibility;

// Re-exports
pub use backend::SqliteBackend;
pub use config::SqliteConfig;
pub use connection::SqlitePool;
pub use error::{SqliteError, SqliteResult};
pub use ledger::SqliteLedger;
pub use links::SqliteLinkResolver;
pub use locks::SqliteLockMaintenance;
pub use merge::SqliteMergeEngine;
pub use reconcile::{PruneReport, ReconcileReport, RelationshipDelta};
pub use state::SqliteStateMachine;
pub use store::SqliteGraphStore;
pub use visibility::SqliteVisibilityStore;
