//! SQLite-backed persistence for scheduler state.
//! Survives restarts; one table holds every collection.

use chrono::{DateTime, Utc};
use faultlens_core::{FaultLensError, Result};
use std::path::Path;
use std::sync::Mutex;

use crate::store::{StoreBackend, StoredEntry};

/// SQLite store for schedule records, workflow bodies and pending signals.
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| FaultLensError::storage(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| FaultLensError::storage(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS kv_entries (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,            -- JSON
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_updated ON kv_entries(collection, updated_at);
         ",
            )
            .map_err(|e| FaultLensError::storage(format!("Migration: {e}")))
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl StoreBackend for SqliteBackend {
    fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT value, updated_at FROM kv_entries WHERE collection = ?1 AND key = ?2")
            .map_err(|e| FaultLensError::storage(format!("Get: {e}")))?;
        let mut rows = stmt
            .query(rusqlite::params![collection, key])
            .map_err(|e| FaultLensError::storage(format!("Get: {e}")))?;
        match rows
            .next()
            .map_err(|e| FaultLensError::storage(format!("Get: {e}")))?
        {
            Some(row) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| FaultLensError::storage(format!("Get: {e}")))?;
                let updated_at: String = row
                    .get(1)
                    .map_err(|e| FaultLensError::storage(format!("Get: {e}")))?;
                Ok(Some(StoredEntry {
                    key: key.to_string(),
                    value,
                    updated_at: parse_time(&updated_at),
                }))
            }
            None => Ok(None),
        }
    }

    fn put(&self, collection: &str, key: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO kv_entries (collection, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![collection, key, value, updated_at.to_rfc3339()],
            )
            .map_err(|e| FaultLensError::storage(format!("Put: {e}")))?;
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "DELETE FROM kv_entries WHERE collection = ?1 AND key = ?2",
                rusqlite::params![collection, key],
            )
            .map_err(|e| FaultLensError::storage(format!("Delete: {e}")))?;
        Ok(n > 0)
    }

    fn entries(&self, collection: &str) -> Result<Vec<StoredEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT key, value, updated_at FROM kv_entries WHERE collection = ?1 ORDER BY key")
            .map_err(|e| FaultLensError::storage(format!("Entries: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![collection], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok(StoredEntry {
                    key,
                    value,
                    updated_at: parse_time(&updated_at),
                })
            })
            .map_err(|e| FaultLensError::storage(format!("Entries: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FaultLensError::storage(format!("Entries: {e}")))
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM kv_entries WHERE collection = ?1",
                rusqlite::params![collection],
            )
            .map_err(|e| FaultLensError::storage(format!("Clear: {e}")))?;
        Ok(())
    }

    fn prune_older_than(
        &self,
        collection: &str,
        cutoff: DateTime<Utc>,
        keep: &dyn Fn(&str) -> bool,
    ) -> Result<usize> {
        let conn = self.conn();
        // rfc3339 strings from to_rfc3339() are all UTC with the same layout, so
        // lexical comparison matches time order.
        let expired: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT key FROM kv_entries WHERE collection = ?1 AND updated_at < ?2")
                .map_err(|e| FaultLensError::storage(format!("Prune: {e}")))?;
            let rows = stmt
                .query_map(rusqlite::params![collection, cutoff.to_rfc3339()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| FaultLensError::storage(format!("Prune: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| FaultLensError::storage(format!("Prune: {e}")))?
        };

        let mut pruned = 0;
        for key in expired.iter().filter(|k| !keep(k.as_str())) {
            pruned += conn
                .execute(
                    "DELETE FROM kv_entries WHERE collection = ?1 AND key = ?2",
                    rusqlite::params![collection, key],
                )
                .map_err(|e| FaultLensError::storage(format!("Prune: {e}")))?;
        }
        Ok(pruned)
    }
}
