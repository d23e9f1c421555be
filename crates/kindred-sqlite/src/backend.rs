//! All SQLite ports over one pool

use kindred_core::EngineConfig;

use crate::config::SqliteConfig;
use crate::connection::SqlitePool;
use crate::error::SqliteResult;
use crate::ledger::SqliteLedger;
use crate::links::SqliteLinkResolver;
use crate::locks::SqliteLockMaintenance;
use crate::merge::SqliteMergeEngine;
use crate::state::SqliteStateMachine;
use crate::store::SqliteGraphStore;
use crate::visibility::SqliteVisibilityStore;

/// Every port implementation, sharing one pool and one engine config
#[derive(Clone)]
pub struct SqliteBackend {
    pub pool: SqlitePool,
    pub store: SqliteGraphStore,
    pub merges: SqliteMergeEngine,
    pub links: SqliteLinkResolver,
    pub ledger: SqliteLedger,
    pub state: SqliteStateMachine,
    pub locks: SqliteLockMaintenance,
    pub visibility: SqliteVisibilityStore,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool, config: EngineConfig) -> Self {
        Self {
            store: SqliteGraphStore::new(pool.clone(), config.clone()),
            merges: SqliteMergeEngine::new(pool.clone(), config.clone()),
            links: SqliteLinkResolver::new(pool.clone(), config.clone()),
            ledger: SqliteLedger::new(pool.clone(), config.clone()),
            state: SqliteStateMachine::new(pool.clone(), config.clone()),
            locks: SqliteLockMaintenance::new(pool.clone(), config.clone()),
            visibility: SqliteVisibilityStore::new(pool.clone(), config),
            pool,
        }
    }

    /// Open the database at `sqlite.path` and build every port over it
    pub fn open(sqlite: SqliteConfig, config: EngineConfig) -> SqliteResult<Self> {
        Ok(Self::new(SqlitePool::new(sqlite)?, config))
    }

    /// In-memory backend for tests
    pub fn memory() -> SqliteResult<Self> {
        Self::open(SqliteConfig::memory(), EngineConfig::default())
    }
}
