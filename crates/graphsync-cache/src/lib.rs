//! GraphSync Cache - SQLite adapter for the record graph
//!
//! Implements the `IGraphSyncStore` port of `graphsync-core`. The tables
//! mirror the graph the engine maintains:
//!
//! | Table           | Contents                                       |
//! |-----------------|------------------------------------------------|
//! | `record_groups` | one row per container                          |
//! | `records`       | files and folders, keyed by external id        |
//! | `permissions`   | grantee edges, cascaded with their record      |
//! | `sync_points`   | resume cursors per container                   |
//! | `sync_passes`   | pass history with counters and errors          |
//!
//! ```no_run
//! use std::path::Path;
//! use graphsync_cache::{DatabasePool, SqliteGraphStore};
//!
//! # async fn open() -> anyhow::Result<()> {
//! let db = DatabasePool::new(Path::new("/var/lib/graphsync/graphsync.db")).await?;
//! let store = SqliteGraphStore::new(db.pool().clone());
//! # let _ = store;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::{SqliteGraphStore, SqliteSyncTransaction};

/// Store failures, surfaced to the engine through `anyhow`
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
