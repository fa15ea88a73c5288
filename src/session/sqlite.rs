//! SQLite-backed key-value store with per-key expiry.
//!
//! Tables:
//! - `kv`: key, value (JSON text), expires_at (epoch millis)
//!
//! Expiry is enforced by the store: every read filters on `expires_at`, and
//! every write purges rows that have already lapsed, so callers never need
//! to check timestamps themselves.

use super::{BackendKind, SessionBackend};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create session store directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open session store {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to configure session store")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);",
        )
        .context("Failed to initialize session store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl SessionBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Persistent
    }

    fn put(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<()> {
        let now = now_millis();
        let encoded = serde_json::to_string(value)?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            params![key, encoded, expires_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|text| serde_json::from_str(&text).context("Corrupt value in session store"))
            .transpose()
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at > ?2",
            params![key, now_millis()],
        )?;
        Ok(deleted > 0)
    }

    fn touch(&self, key: &str, value: &Value, expires_at: DateTime<Utc>) -> Result<bool> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE kv SET value = ?2, expires_at = ?3 WHERE key = ?1 AND expires_at > ?4",
            params![key, encoded, expires_at.timestamp_millis(), now_millis()],
        )?;
        Ok(updated > 0)
    }

    fn take(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.lock();
        // IMMEDIATE so another process sharing the file cannot read the row
        // between our read and our delete.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        tx.commit()?;
        raw.map(|text| serde_json::from_str(&text).context("Corrupt value in session store"))
            .transpose()
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2",
        )?;
        let rows = stmt
            .query_map(params![prefix, now_millis()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (key, text) in rows {
            match serde_json::from_str(&text) {
                Ok(value) => entries.push((key, value)),
                Err(e) => tracing::warn!("Skipping corrupt session store entry: {e}"),
            }
        }
        Ok(entries)
    }

    fn sweep_expired(&self) -> Result<u64> {
        // Lapsed rows are invisible to reads and purged on write.
        Ok(0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
