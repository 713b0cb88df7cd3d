//! SQLite pool setup for the record graph
//!
//! File databases run in WAL mode with a small pool so container tasks can
//! read while one of them flushes. In-memory databases live on exactly one
//! connection that is never recycled; closing it would drop the data.
//! Foreign keys are enabled on every connection so permission edges cascade
//! with their record.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Connections for file-backed databases
const FILE_POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_SCHEMA: &str = include_str!("migrations/20261019_initial.sql");

/// Shared handle to the record graph database
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path` and applies the schema
    ///
    /// # Errors
    /// `ConnectionFailed` if the directory or database cannot be opened,
    /// `MigrationFailed` if the schema cannot be applied
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("{}: {e}", db_path.display()))
            })?;

        let db = Self { pool };
        db.apply_schema().await?;
        tracing::info!(path = %db_path.display(), connections = FILE_POOL_SIZE, "Opened record graph database");
        Ok(db)
    }

    /// Creates a private in-memory database, mainly for tests
    ///
    /// # Errors
    /// Same as [`DatabasePool::new`]
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?;

        let db = Self { pool };
        db.apply_schema().await?;
        tracing::debug!("Opened in-memory record graph database");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The schema is idempotent (`IF NOT EXISTS`), so reopening is safe
    async fn apply_schema(&self) -> Result<(), CacheError> {
        sqlx::raw_sql(INITIAL_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("initial schema: {e}")))?;
        Ok(())
    }
}
