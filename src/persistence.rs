//! # SQLite Presence Store
//!
//! Durable [`PresenceStore`] backed by SQLite, for hosts that keep presence
//! on-device or share a database between processes.
//!
//! Presence records are stored as MessagePack blobs alongside the scalar
//! columns the queries need. Daily arrival claims ride on the table's
//! primary key: `INSERT OR IGNORE` against `(group_id, claim_date)` is the
//! conditional create-if-absent write, and SQLite's locking makes it atomic
//! across processes, not just threads.

use std::sync::Mutex;

use log::warn;
use rusqlite::{params, Connection};

use crate::arbiter::DailyArrivalClaim;
use crate::error::{PresenceError, Result};
use crate::storage::PresenceStore;
use crate::PresenceRecord;

/// SQLite-backed presence store.
pub struct SqlitePresenceStore {
    db: Mutex<Connection>,
}

impl SqlitePresenceStore {
    /// Open (or create) a store at the given database path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init_schema(&conn).map_err(storage_err)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- One row per (user, group); scalar columns for queries, full
            -- record as a MessagePack blob
            CREATE TABLE IF NOT EXISTS presence (
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                is_present INTEGER NOT NULL,
                is_manual INTEGER NOT NULL,
                last_updated INTEGER NOT NULL,
                record BLOB NOT NULL,
                PRIMARY KEY (user_id, group_id)
            );

            -- Write-once daily arrival claims; the primary key carries the
            -- single-winner guarantee
            CREATE TABLE IF NOT EXISTS claims (
                group_id TEXT NOT NULL,
                claim_date TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, claim_date)
            );

            CREATE INDEX IF NOT EXISTS idx_presence_group ON presence(group_id);
            CREATE INDEX IF NOT EXISTS idx_presence_updated ON presence(last_updated);
        "#,
        )
    }

    /// Delete presence rows last updated before `cutoff` and claims created
    /// before it. Retention is this layer's policy; the engine itself only
    /// ever treats stale rows as absent.
    pub fn purge_stale(&self, cutoff: i64) -> Result<usize> {
        let conn = self.lock()?;
        let purged = conn
            .execute("DELETE FROM presence WHERE last_updated < ?1", params![cutoff])
            .map_err(storage_err)?;
        conn.execute("DELETE FROM claims WHERE created_at < ?1", params![cutoff])
            .map_err(storage_err)?;
        Ok(purged)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| PresenceError::StorageWrite {
            message: "database handle poisoned".to_string(),
        })
    }
}

impl PresenceStore for SqlitePresenceStore {
    fn upsert_presence(&self, record: &PresenceRecord) -> Result<()> {
        let blob = rmp_serde::to_vec(record).map_err(|err| PresenceError::StorageWrite {
            message: format!("record encoding failed: {}", err),
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO presence \
             (user_id, group_id, is_present, is_manual, last_updated, record) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.user_id,
                record.group_id,
                record.is_present as i64,
                record.is_manual as i64,
                record.last_updated,
                blob,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn presence_snapshot(&self, group_id: &str) -> Result<Vec<PresenceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT record FROM presence WHERE group_id = ?1")
            .map_err(storage_err)?;

        let blobs = stmt
            .query_map(params![group_id], |row| row.get::<_, Vec<u8>>(0))
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for blob in blobs {
            let blob = blob.map_err(storage_err)?;
            match rmp_serde::from_slice::<PresenceRecord>(&blob) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!("[SqliteStore] skipping undecodable presence row: {}", err);
                }
            }
        }
        Ok(records)
    }

    fn create_claim_if_absent(&self, claim: &DailyArrivalClaim) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO claims (group_id, claim_date, user_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    claim.group_id,
                    claim.claim_date,
                    claim.user_id,
                    claim.timestamp,
                ],
            )
            .map_err(storage_err)?;
        Ok(inserted == 1)
    }
}

fn storage_err(err: rusqlite::Error) -> PresenceError {
    PresenceError::StorageWrite {
        message: err.to_string(),
    }
}
