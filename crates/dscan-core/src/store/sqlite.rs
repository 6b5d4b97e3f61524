//! SQLite-backed object store
//!
//! A single database file holds every pool of a cluster. Each worker opens
//! its own connection; conditional writes run inside immediate transactions
//! so the version check and the update are atomic across processes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Cluster, ObjectStat, ObjectStore, Versioned};
use crate::codec::{decode_u64, encode_u64};
use crate::error::StoreError;
use crate::types::PoolId;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSummary {
    pub id: PoolId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub objects: u64,
}

/// Cluster stored in one SQLite file
pub struct SqliteCluster {
    conn: Connection,
    db_path: PathBuf,
}

impl SqliteCluster {
    /// Open or create a cluster database at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cluster directory")?;
        }

        let conn = Connection::open(&db_path)
            .context(format!("Failed to open cluster database at {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let cluster = Self { conn, db_path };
        cluster.initialize_schema()?;

        Ok(cluster)
    }

    /// Get the default database path (~/.dscan/cluster.db)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".dscan").join("cluster.db"))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS pools (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
                pool INTEGER NOT NULL,
                oid TEXT NOT NULL,
                data BLOB NOT NULL,
                mtime_sec INTEGER NOT NULL,
                mtime_nsec INTEGER NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (pool, oid)
            );

            CREATE TABLE IF NOT EXISTS xattrs (
                pool INTEGER NOT NULL,
                oid TEXT NOT NULL,
                name TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (pool, oid, name)
            );
            "#,
            )
            .context("Failed to initialize cluster schema")?;

        Ok(())
    }

    /// Register a pool; existing pools with the same id are left alone
    pub fn create_pool(&self, id: PoolId, name: &str) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO pools (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id, name, Utc::now().to_rfc3339()],
            )
            .context(format!("Failed to create pool {}", id))?;

        if inserted > 0 {
            tracing::info!("Created pool {} ({})", id, name);
        }
        Ok(inserted > 0)
    }

    pub fn list_pools(&self) -> Result<Vec<PoolSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.id, p.name, p.created_at,
                   (SELECT COUNT(*) FROM objects o WHERE o.pool = p.id)
            FROM pools p ORDER BY p.id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(2)?;
            let objects: i64 = row.get(3)?;
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, created_at, objects))
        })?;

        let mut pools = Vec::new();
        for row in rows {
            let (id, name, created_at, objects) = row?;
            pools.push(PoolSummary {
                id,
                name,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .context("Invalid pool timestamp")?
                    .with_timezone(&Utc),
                objects: objects as u64,
            });
        }
        Ok(pools)
    }

    /// Open a pool with a concrete store type (for seeding and inspection)
    pub fn open_sqlite_pool(&self, pool_id: PoolId) -> Result<SqliteStore, StoreError> {
        let known: Option<i64> = self
            .conn
            .query_row("SELECT id FROM pools WHERE id = ?1", params![pool_id], |row| row.get(0))
            .optional()?;
        if known.is_none() {
            return Err(StoreError::Unreachable(format!("pool {} does not exist", pool_id)));
        }

        let conn = Connection::open(&self.db_path)
            .map_err(|e| StoreError::Unreachable(format!("{}: {}", self.db_path.display(), e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            pool: pool_id,
        })
    }
}

impl Cluster for SqliteCluster {
    fn open_pool(&self, pool_id: PoolId) -> Result<Arc<dyn ObjectStore>, StoreError> {
        Ok(Arc::new(self.open_sqlite_pool(pool_id)?))
    }
}

/// One pool inside a [`SqliteCluster`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pool: PoolId,
}

fn now_parts() -> (i64, i64) {
    let now = Utc::now();
    (now.timestamp(), now.timestamp_subsec_nanos() as i64)
}

impl SqliteStore {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    /// Seed an object with an explicit mtime, replacing any previous one
    pub fn insert(&self, oid: &str, data: &[u8], mtime: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM xattrs WHERE pool = ?1 AND oid = ?2",
            params![self.pool, oid],
        )?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO objects (pool, oid, data, mtime_sec, mtime_nsec, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            "#,
            params![
                self.pool,
                oid,
                data,
                mtime.timestamp(),
                mtime.timestamp_subsec_nanos() as i64
            ],
        )?;
        Ok(())
    }

    fn version_of(conn: &Connection, pool: PoolId, oid: &str) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM objects WHERE pool = ?1 AND oid = ?2",
                params![pool, oid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

impl ObjectStore for SqliteStore {
    fn stat(&self, oid: &str) -> Result<ObjectStat, StoreError> {
        let conn = self.lock()?;
        let row: Option<(i64, i64, i64, i64)> = conn
            .query_row(
                r#"
                SELECT length(data), mtime_sec, mtime_nsec, version
                FROM objects WHERE pool = ?1 AND oid = ?2
                "#,
                params![self.pool, oid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let (size, secs, nsecs, version) =
            row.ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        let mtime = DateTime::from_timestamp(secs, nsecs as u32)
            .ok_or_else(|| StoreError::Backend(format!("{}: mtime out of range", oid)))?;
        Ok(ObjectStat {
            size: size as u64,
            mtime,
            version: version as u64,
        })
    }

    fn read_versioned(&self, oid: &str) -> Result<Versioned, StoreError> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT data, version FROM objects WHERE pool = ?1 AND oid = ?2",
                params![self.pool, oid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (data, version) = row.ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        Ok(Versioned {
            data,
            version: version as u64,
        })
    }

    fn create_exclusive(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let (secs, nsecs) = now_parts();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO objects (pool, oid, data, mtime_sec, mtime_nsec, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            "#,
            params![self.pool, oid, data, secs, nsecs],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(oid.to_string()));
        }
        Ok(())
    }

    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let (secs, nsecs) = now_parts();
        conn.execute(
            r#"
            INSERT INTO objects (pool, oid, data, mtime_sec, mtime_nsec, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            ON CONFLICT (pool, oid) DO UPDATE SET
                data = excluded.data,
                mtime_sec = excluded.mtime_sec,
                mtime_nsec = excluded.mtime_nsec,
                version = objects.version + 1
            "#,
            params![self.pool, oid, data, secs, nsecs],
        )?;
        Ok(())
    }

    fn compare_and_write(
        &self,
        oid: &str,
        expected_version: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let actual = Self::version_of(&tx, self.pool, oid)?
            .ok_or_else(|| StoreError::NotFound(oid.to_string()))?;
        if actual != expected_version {
            return Err(StoreError::VersionMismatch {
                oid: oid.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let (secs, nsecs) = now_parts();
        tx.execute(
            r#"
            UPDATE objects SET data = ?3, mtime_sec = ?4, mtime_nsec = ?5, version = version + 1
            WHERE pool = ?1 AND oid = ?2
            "#,
            params![self.pool, oid, data, secs, nsecs],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_xattr(&self, oid: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let conn = self.lock()?;
        if Self::version_of(&conn, self.pool, oid)?.is_none() {
            return Err(StoreError::NotFound(oid.to_string()));
        }
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM xattrs WHERE pool = ?1 AND oid = ?2 AND name = ?3",
                params![self.pool, oid, name],
                |row| row.get(0),
            )
            .optional()?;
        value.ok_or_else(|| StoreError::NotFound(format!("{}@{}", oid, name)))
    }

    fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if Self::version_of(&tx, self.pool, oid)?.is_none() {
            return Err(StoreError::NotFound(oid.to_string()));
        }
        tx.execute(
            "INSERT OR REPLACE INTO xattrs (pool, oid, name, value) VALUES (?1, ?2, ?3, ?4)",
            params![self.pool, oid, name, value],
        )?;
        tx.execute(
            "UPDATE objects SET version = version + 1 WHERE pool = ?1 AND oid = ?2",
            params![self.pool, oid],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn xattr_max_u64(&self, oid: &str, name: &str, value: u64) -> Result<u64, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (secs, nsecs) = now_parts();
        tx.execute(
            r#"
            INSERT OR IGNORE INTO objects (pool, oid, data, mtime_sec, mtime_nsec, version)
            VALUES (?1, ?2, x'', ?3, ?4, 1)
            "#,
            params![self.pool, oid, secs, nsecs],
        )?;
        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM xattrs WHERE pool = ?1 AND oid = ?2 AND name = ?3",
                params![self.pool, oid, name],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(raw) => Some(
                decode_u64(&raw)
                    .map_err(|e| StoreError::Backend(format!("{}@{}: {}", oid, name, e)))?,
            ),
            None => None,
        };
        if let Some(existing) = current {
            if existing >= value {
                return Ok(existing);
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO xattrs (pool, oid, name, value) VALUES (?1, ?2, ?3, ?4)",
            params![self.pool, oid, name, encode_u64(value)],
        )?;
        tx.execute(
            "UPDATE objects SET version = version + 1 WHERE pool = ?1 AND oid = ?2",
            params![self.pool, oid],
        )?;
        tx.commit()?;
        Ok(value)
    }

    fn list_objects(&self, after: Option<&str>, max: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let limit = max.min(i64::MAX as usize) as i64;
        let mut names: Vec<String> = Vec::new();
        match after {
            Some(after) => {
                let mut stmt = conn.prepare(
                    "SELECT oid FROM objects WHERE pool = ?1 AND oid > ?2 ORDER BY oid LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![self.pool, after, limit], |row| row.get(0))?;
                for row in rows {
                    names.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT oid FROM objects WHERE pool = ?1 ORDER BY oid LIMIT ?2")?;
                let rows = stmt.query_map(params![self.pool, limit], |row| row.get(0))?;
                for row in rows {
                    names.push(row?);
                }
            }
        }
        Ok(names)
    }
}
