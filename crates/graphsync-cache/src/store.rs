//! SQLite implementation of IGraphSyncStore
//!
//! This module provides the concrete SQLite-based implementation of the
//! graph store port defined in graphsync-core. Every write path goes through
//! a transaction so that a flushed batch either fully applies or fully
//! rolls back.
//!
//! ## Type Mapping
//!
//! | Domain Type              | SQL Type | Strategy                                   |
//! |--------------------------|----------|--------------------------------------------|
//! | RecordId, GroupId, PassId| TEXT     | UUID string via `.to_string()`             |
//! | ExternalId, OrgId, ...   | TEXT     | String via `.as_str()`                     |
//! | DateTime<Utc>            | TEXT     | ISO 8601 via `to_rfc3339()`                |
//! | PermissionRole           | TEXT     | `READ` / `WRITE` / `OWNER`                 |
//! | EntityType               | TEXT     | `USER` / `GROUP` / `ORG` / `PUBLIC`        |
//! | PassStatus               | TEXT     | serde_json serialization                   |
//! | PassCounters, errors     | TEXT     | serde_json serialization                   |

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use graphsync_core::domain::{
    ContainerRef, EntityType, ExternalId, Permission, PermissionRole, Record, RecordGroup,
    RecordId, SyncPass, SyncPoint, SyncPointKey,
};
use graphsync_core::ports::{IGraphSyncStore, ISyncTransaction, RecordWrite};

use crate::CacheError;

/// SQLite-based implementation of the graph store port
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite default format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional datetime string, treating empty as None
fn parse_optional_datetime(s: Option<String>) -> Result<Option<String>, CacheError> {
    match s {
        Some(ref v) if !v.is_empty() => Ok(Some(parse_datetime(v)?.to_rfc3339())),
        _ => Ok(None),
    }
}

/// Reconstruct a Record from a database row
///
/// Goes through serde so the stored identity, version and timestamps are
/// preserved rather than regenerated by `Record::new`.
fn record_from_row(row: &SqliteRow) -> Result<Record, CacheError> {
    let id: String = row.get("id");
    let external_id: String = row.get("external_id");
    let external_revision_id: String = row.get("external_revision_id");
    let path: String = row.get("path");
    let parent_external_id: Option<String> = row.get("parent_external_id");
    let record_name: String = row.get("record_name");
    let version: i64 = row.get("version");
    let is_file: bool = row.get("is_file");
    let connector_name: String = row.get("connector_name");
    let org_id: String = row.get("org_id");
    let container_id: String = row.get("container_id");
    let mime_type: Option<String> = row.get("mime_type");
    let size_bytes: Option<i64> = row.get("size_bytes");
    let web_url: Option<String> = row.get("web_url");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let source_created_at = parse_optional_datetime(row.get("source_created_at"))?;
    let source_updated_at = parse_optional_datetime(row.get("source_updated_at"))?;

    let created_at = parse_datetime(&created_at)?.to_rfc3339();
    let updated_at = parse_datetime(&updated_at)?.to_rfc3339();
    let size_bytes = size_bytes.map(|s| s as u64);

    let record_json = serde_json::json!({
        "id": id,
        "external_id": external_id,
        "external_revision_id": external_revision_id,
        "path": path,
        "parent_external_id": parent_external_id,
        "record_name": record_name,
        "version": version as u64,
        "is_file": is_file,
        "connector_name": connector_name,
        "org_id": org_id,
        "container_id": container_id,
        "mime_type": mime_type,
        "size_bytes": size_bytes,
        "web_url": web_url,
        "created_at": created_at,
        "updated_at": updated_at,
        "source_created_at": source_created_at,
        "source_updated_at": source_updated_at,
    });

    serde_json::from_value(record_json).map_err(|e| {
        CacheError::SerializationError(format!("Failed to reconstruct Record from row: {}", e))
    })
}

/// Reconstruct a RecordGroup from a database row
fn record_group_from_row(row: &SqliteRow) -> Result<RecordGroup, CacheError> {
    let id: String = row.get("id");
    let external_group_id: String = row.get("external_group_id");
    let org_id: String = row.get("org_id");
    let connector_name: String = row.get("connector_name");
    let name: String = row.get("name");
    let owner_id: Option<String> = row.get("owner_id");
    let web_url: Option<String> = row.get("web_url");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let created_at = parse_datetime(&created_at)?.to_rfc3339();
    let updated_at = parse_datetime(&updated_at)?.to_rfc3339();

    let group_json = serde_json::json!({
        "id": id,
        "external_group_id": external_group_id,
        "org_id": org_id,
        "connector_name": connector_name,
        "name": name,
        "owner_id": owner_id,
        "web_url": web_url,
        "created_at": created_at,
        "updated_at": updated_at,
    });

    serde_json::from_value(group_json).map_err(|e| {
        CacheError::SerializationError(format!("Failed to reconstruct RecordGroup from row: {}", e))
    })
}

/// Reconstruct a Permission from a database row
fn permission_from_row(row: &SqliteRow) -> Result<Permission, CacheError> {
    let role_str: String = row.get("role");
    let entity_str: String = row.get("entity_type");

    let role = PermissionRole::parse(&role_str).ok_or_else(|| {
        CacheError::SerializationError(format!("Unknown permission role: {}", role_str))
    })?;
    let entity_type = EntityType::parse(&entity_str).ok_or_else(|| {
        CacheError::SerializationError(format!("Unknown entity type: {}", entity_str))
    })?;

    let grantee_id: String = row.get("grantee_id");
    let email: Option<String> = row.get("email");

    Ok(Permission::new(grantee_id, email, role, entity_type))
}

/// Reconstruct a SyncPass from a database row
fn pass_from_row(row: &SqliteRow) -> Result<SyncPass, CacheError> {
    let status_str: String = row.get("status");
    let counters_str: String = row.get("counters");
    let errors_str: String = row.get("errors");

    let status: serde_json::Value = serde_json::from_str(&status_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid pass status '{}': {}", status_str, e))
    })?;
    let counters: serde_json::Value = serde_json::from_str(&counters_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid pass counters JSON: {}", e))
    })?;
    let errors: serde_json::Value = match serde_json::from_str(&errors_str) {
        Ok(v @ serde_json::Value::Array(_)) => v,
        _ => serde_json::json!([]),
    };

    let id: String = row.get("id");
    let org_id: String = row.get("org_id");
    let connector_name: String = row.get("connector_name");
    let container_id: String = row.get("container_id");
    let kind: String = row.get("kind");
    let started_at = parse_optional_datetime(row.get("started_at"))?;
    let completed_at = parse_optional_datetime(row.get("completed_at"))?;

    let pass_json = serde_json::json!({
        "id": id,
        "container": {
            "org_id": org_id,
            "connector": connector_name,
            "container_id": container_id,
        },
        "kind": kind,
        "status": status,
        "started_at": started_at,
        "completed_at": completed_at,
        "counters": counters,
        "errors": errors,
    });

    serde_json::from_value(pass_json).map_err(|e| {
        CacheError::SerializationError(format!("Failed to reconstruct SyncPass from row: {}", e))
    })
}

// ============================================================================
// Write helpers shared by auto-commit and explicit transactions
// ============================================================================

async fn upsert_record(conn: &mut SqliteConnection, record: &Record) -> Result<(), CacheError> {
    let id = record.id().to_string();

    let result = sqlx::query(
        "INSERT INTO records \
         (id, org_id, connector_name, container_id, external_id, external_revision_id, \
          path, parent_external_id, record_name, version, is_file, mime_type, size_bytes, \
          web_url, created_at, updated_at, source_created_at, source_updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
           external_id = excluded.external_id, \
           external_revision_id = excluded.external_revision_id, \
           path = excluded.path, \
           parent_external_id = excluded.parent_external_id, \
           record_name = excluded.record_name, \
           version = excluded.version, \
           mime_type = excluded.mime_type, \
           size_bytes = excluded.size_bytes, \
           web_url = excluded.web_url, \
           updated_at = excluded.updated_at, \
           source_created_at = excluded.source_created_at, \
           source_updated_at = excluded.source_updated_at \
         WHERE excluded.version >= records.version",
    )
    .bind(&id)
    .bind(record.org_id().as_str())
    .bind(record.connector_name().as_str())
    .bind(record.container_id().as_str())
    .bind(record.external_id().as_str())
    .bind(record.external_revision_id())
    .bind(record.path())
    .bind(record.parent_external_id().map(|p| p.as_str()))
    .bind(record.record_name())
    .bind(record.version() as i64)
    .bind(record.is_file())
    .bind(record.mime_type())
    .bind(record.size_bytes().map(|s| s as i64))
    .bind(record.web_url())
    .bind(record.created_at().to_rfc3339())
    .bind(record.updated_at().to_rfc3339())
    .bind(record.source_created_at().map(|dt| dt.to_rfc3339()))
    .bind(record.source_updated_at().map(|dt| dt.to_rfc3339()))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        tracing::warn!(
            record_id = %id,
            version = record.version(),
            "Ignored stale record write"
        );
    } else {
        tracing::trace!(record_id = %id, version = record.version(), "Upserted record");
    }
    Ok(())
}

async fn replace_permissions(
    conn: &mut SqliteConnection,
    id: &RecordId,
    permissions: &[Permission],
) -> Result<(), CacheError> {
    let id_str = id.to_string();

    sqlx::query("DELETE FROM permissions WHERE record_id = ?")
        .bind(&id_str)
        .execute(&mut *conn)
        .await?;

    for permission in permissions {
        sqlx::query(
            "INSERT INTO permissions (record_id, grantee_id, email, role, entity_type) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(record_id, grantee_id) DO UPDATE SET \
               email = excluded.email, role = excluded.role, entity_type = excluded.entity_type",
        )
        .bind(&id_str)
        .bind(&permission.grantee_id)
        .bind(&permission.email)
        .bind(permission.role.as_str())
        .bind(permission.entity_type.as_str())
        .execute(&mut *conn)
        .await?;
    }

    tracing::trace!(record_id = %id_str, count = permissions.len(), "Replaced permission edges");
    Ok(())
}

async fn upsert_batch(conn: &mut SqliteConnection, batch: &[RecordWrite]) -> Result<(), CacheError> {
    for write in batch {
        upsert_record(conn, &write.record).await?;
        replace_permissions(conn, write.record.id(), &write.permissions).await?;
    }
    Ok(())
}

async fn delete_record_in(conn: &mut SqliteConnection, id: &RecordId) -> Result<bool, CacheError> {
    let id_str = id.to_string();

    sqlx::query("DELETE FROM permissions WHERE record_id = ?")
        .bind(&id_str)
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("DELETE FROM records WHERE id = ?")
        .bind(&id_str)
        .execute(&mut *conn)
        .await?;

    tracing::trace!(record_id = %id_str, "Deleted record");
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Transaction
// ============================================================================

/// An open SQLite write transaction
pub struct SqliteSyncTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait::async_trait]
impl ISyncTransaction for SqliteSyncTransaction {
    async fn upsert_records_batch(&mut self, batch: &[RecordWrite]) -> anyhow::Result<()> {
        upsert_batch(&mut self.tx, batch).await?;
        Ok(())
    }

    async fn delete_record(&mut self, id: &RecordId) -> anyhow::Result<bool> {
        Ok(delete_record_in(&mut self.tx, id).await?)
    }

    async fn replace_permission_edges(
        &mut self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> anyhow::Result<()> {
        replace_permissions(&mut self.tx, id, permissions).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let SqliteSyncTransaction { tx } = *self;
        tx.commit().await.map_err(CacheError::from)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        let SqliteSyncTransaction { tx } = *self;
        tx.rollback().await.map_err(CacheError::from)?;
        Ok(())
    }
}

// ============================================================================
// IGraphSyncStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IGraphSyncStore for SqliteGraphStore {
    // --- Record lookups ---

    async fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<Record>> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_record_by_external_id(
        &self,
        container: &ContainerRef,
        external_id: &ExternalId,
    ) -> anyhow::Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT * FROM records \
             WHERE org_id = ? AND connector_name = ? AND container_id = ? AND external_id = ?",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .bind(external_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(record_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_records_by_fingerprint(
        &self,
        container: &ContainerRef,
        fingerprint: &str,
        excluding: &HashSet<RecordId>,
    ) -> anyhow::Result<Vec<Record>> {
        if fingerprint.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT * FROM records \
             WHERE org_id = ? AND connector_name = ? AND container_id = ? \
               AND external_revision_id = ? \
             ORDER BY updated_at DESC, id ASC",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            if !excluding.contains(record.id()) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_container_records(
        &self,
        container: &ContainerRef,
    ) -> anyhow::Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT * FROM records \
             WHERE org_id = ? AND connector_name = ? AND container_id = ? \
             ORDER BY path ASC",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    async fn count_records(&self, container: &ContainerRef) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records \
             WHERE org_id = ? AND connector_name = ? AND container_id = ?",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn get_permissions(&self, id: &RecordId) -> anyhow::Result<Vec<Permission>> {
        let rows = sqlx::query(
            "SELECT * FROM permissions WHERE record_id = ? ORDER BY grantee_id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut permissions = Vec::with_capacity(rows.len());
        for row in &rows {
            permissions.push(permission_from_row(row)?);
        }
        Ok(permissions)
    }

    // --- Record writes (auto-commit) ---

    async fn upsert_records_batch(&self, batch: &[RecordWrite]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_batch(&mut tx, batch).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_record(&self, id: &RecordId) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_record_in(&mut tx, id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn replace_permission_edges(
        &self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_permissions(&mut tx, id, permissions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn ISyncTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteSyncTransaction { tx }))
    }

    // --- Record groups ---

    async fn upsert_record_group(&self, group: &RecordGroup) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO record_groups \
             (id, org_id, connector_name, external_group_id, name, owner_id, web_url, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(org_id, connector_name, external_group_id) DO UPDATE SET \
               name = excluded.name, \
               owner_id = excluded.owner_id, \
               web_url = excluded.web_url, \
               updated_at = excluded.updated_at",
        )
        .bind(group.id().to_string())
        .bind(group.org_id().as_str())
        .bind(group.connector_name().as_str())
        .bind(group.external_group_id().as_str())
        .bind(group.name())
        .bind(group.owner_id())
        .bind(group.web_url())
        .bind(group.created_at().to_rfc3339())
        .bind(group.updated_at().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(group = %group.external_group_id(), "Upserted record group");
        Ok(())
    }

    async fn get_record_group(
        &self,
        container: &ContainerRef,
    ) -> anyhow::Result<Option<RecordGroup>> {
        let row = sqlx::query(
            "SELECT * FROM record_groups \
             WHERE org_id = ? AND connector_name = ? AND external_group_id = ?",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(record_group_from_row(r)?)),
            None => Ok(None),
        }
    }

    // --- Sync points ---

    async fn get_sync_point(&self, key: &SyncPointKey) -> anyhow::Result<Option<SyncPoint>> {
        let row = sqlx::query("SELECT cursor, last_run_ts FROM sync_points WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| SyncPoint::new(r.get::<String, _>("cursor"), r.get::<i64, _>("last_run_ts"))))
    }

    async fn save_sync_point(&self, key: &SyncPointKey, point: &SyncPoint) -> anyhow::Result<()> {
        let key_str = key.to_string();

        sqlx::query(
            "INSERT INTO sync_points (key, cursor, last_run_ts) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
               cursor = excluded.cursor, last_run_ts = excluded.last_run_ts",
        )
        .bind(&key_str)
        .bind(&point.cursor)
        .bind(point.last_run_ts)
        .execute(&self.pool)
        .await?;

        tracing::trace!(key = %key_str, "Saved sync point");
        Ok(())
    }

    // --- Passes ---

    async fn save_pass(&self, pass: &SyncPass) -> anyhow::Result<()> {
        let id = pass.id().to_string();
        let status = serde_json::to_string(pass.status())
            .map_err(|e| anyhow::anyhow!("Failed to serialize pass status: {}", e))?;
        let counters = serde_json::to_string(pass.counters())
            .map_err(|e| anyhow::anyhow!("Failed to serialize pass counters: {}", e))?;
        let errors = serde_json::to_string(pass.errors())
            .map_err(|e| anyhow::anyhow!("Failed to serialize pass errors: {}", e))?;

        sqlx::query(
            "INSERT INTO sync_passes \
             (id, org_id, connector_name, container_id, kind, status, started_at, \
              completed_at, counters, errors) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               status = excluded.status, \
               started_at = excluded.started_at, \
               completed_at = excluded.completed_at, \
               counters = excluded.counters, \
               errors = excluded.errors",
        )
        .bind(&id)
        .bind(pass.container().org_id.as_str())
        .bind(pass.container().connector.as_str())
        .bind(pass.container().container_id.as_str())
        .bind(pass.kind().as_str())
        .bind(&status)
        .bind(pass.started_at().map(|dt| dt.to_rfc3339()))
        .bind(pass.completed_at().map(|dt| dt.to_rfc3339()))
        .bind(&counters)
        .bind(&errors)
        .execute(&self.pool)
        .await?;

        tracing::trace!(pass_id = %id, status = %pass.status(), "Saved sync pass");
        Ok(())
    }

    async fn get_latest_pass(&self, container: &ContainerRef) -> anyhow::Result<Option<SyncPass>> {
        let row = sqlx::query(
            "SELECT * FROM sync_passes \
             WHERE org_id = ? AND connector_name = ? AND container_id = ? \
             ORDER BY rowid DESC LIMIT 1",
        )
        .bind(container.org_id.as_str())
        .bind(container.connector.as_str())
        .bind(container.container_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(pass_from_row(r)?)),
            None => Ok(None),
        }
    }
}
