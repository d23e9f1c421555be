//! SQLite connection management
//!
//! Uses a simple Arc<Mutex<Connection>> pattern instead of r2d2 to avoid
//! version conflicts with other workspace crates. Every statement of the
//! process goes through the one connection, so each closure passed to
//! [`SqlitePool::with_transaction`] runs without interleaving.

use std::sync::Arc;

use kindred_core::GraphResult;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use crate::schema;

/// Thread-safe SQLite connection wrapper
#[derive(Clone)]
pub struct SqlitePool {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
}

impl SqlitePool {
    /// Open the database and apply pragmas and migrations
    pub fn new(config: SqliteConfig) -> SqliteResult<Self> {
        info!(path = ?config.path, "Opening SQLite database");

        let conn = if config.is_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        SqliteError::Connection(format!("Failed to create directory: {}", e))
                    })?;
                }
            }
            Connection::open(&config.path)?
        };

        let pool = Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        };
        pool.initialize()?;
        Ok(pool)
    }

    /// Create an in-memory pool for testing
    pub fn memory() -> SqliteResult<Self> {
        Self::new(SqliteConfig::memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Execute a closure with the connection
    pub fn with_connection<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside an immediate transaction
    ///
    /// Commits when the closure returns `Ok`; any error rolls the whole
    /// transaction back.
    pub fn with_transaction<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> SqliteResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run blocking database work off the async runtime
    pub async fn run<F, T>(&self, f: F) -> GraphResult<T>
    where
        F: FnOnce(&SqlitePool) -> SqliteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || f(&pool))
            .await
            .map_err(|e| SqliteError::Task(e.to_string()))?
            .map_err(Into::into)
    }

    fn initialize(&self) -> SqliteResult<()> {
        self.with_connection(|conn| {
            self.configure_pragmas(conn)?;
            schema::apply_migrations(conn)?;
            info!("SQLite database initialized successfully");
            Ok(())
        })
    }

    fn configure_pragmas(&self, conn: &Connection) -> SqliteResult<()> {
        debug!("Configuring SQLite pragmas");

        if self.config.wal_mode && !self.config.is_memory() {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        }

        // Cascades and SET NULL actions depend on this
        if self.config.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }

        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            self.config.busy_timeout_ms
        ))?;
        conn.execute_batch(&format!("PRAGMA cache_size = {};", self.config.cache_size))?;

        if self.config.mmap_size > 0 {
            conn.execute_batch(&format!("PRAGMA mmap_size = {};", self.config.mmap_size))?;
        }

        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_pool() {
        let pool = SqlitePool::memory().expect("Failed to create memory pool");

        pool.with_connection(|conn| {
            let result: i64 = conn.query_row("SELECT 1 + 1", [], |row| row.get(0))?;
            assert_eq!(result, 2);
            Ok(())
        })
        .expect("Query failed");
    }

    #[test]
    fn test_file_pool_uses_wal() {
        let dir = TempDir::new().unwrap();
        let pool = SqlitePool::new(SqliteConfig::new(dir.path().join("nested/kindred.db")))
            .expect("Failed to create pool");

        pool.with_connection(|conn| {
            let mode: String = conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))?;
            assert_eq!(mode.to_lowercase(), "wal");
            let fk: i64 = conn.query_row("PRAGMA foreign_keys;", [], |row| row.get(0))?;
            assert_eq!(fk, 1);
            Ok(())
        })
        .expect("Query failed");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let pool = SqlitePool::memory().unwrap();
        pool.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE scratch (v INTEGER);")?;
            Ok(())
        })
        .unwrap();

        let result: SqliteResult<()> = pool.with_transaction(|tx| {
            tx.execute("INSERT INTO scratch (v) VALUES (1)", [])?;
            Err(SqliteError::Schema("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = pool
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM scratch", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_run_maps_errors() {
        let pool = SqlitePool::memory().unwrap();
        let err = pool
            .run(|pool| {
                pool.with_connection(|conn| {
                    conn.execute_batch("SELECT * FROM missing_table;")?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, kindred_core::GraphError::Persistence(_)));
    }
}
