//! SQLite snapshot persistence.
//!
//! Crash survival only: one row per conversation keyed by `key` with a
//! JSON-encoded snapshot column, plus an append-only events table. The
//! store in memory is the source of truth; writes here are best-effort.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// Async-safe handle to the proxy database.
///
/// Wraps [`ProxyDb`] behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async workers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<ProxyDb>>,
}

impl DbHandle {
    #[must_use]
    pub fn new(db: ProxyDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure with database access on a blocking thread. Everything
    /// passed into `f` must be owned.
    ///
    /// # Errors
    /// Returns an error if the closure fails or the task panics.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProxyDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|err| anyhow::anyhow!("db lock poisoned: {err}"))?;
            f(&guard)
        })
        .await
        .context("db task panicked")?
    }
}

pub struct ProxyDb {
    conn: Connection,
}

impl ProxyDb {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("failed to create database directory")?;
            }
        }
        let conn = Connection::open(path).context("failed to open sqlite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be constructed.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("failed to set pragmas")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS conversations (
                    key TEXT PRIMARY KEY,
                    model TEXT NOT NULL,
                    context_window INTEGER NOT NULL,
                    phase TEXT NOT NULL DEFAULT 'IDLE',
                    total_input_tokens INTEGER NOT NULL DEFAULT 0,
                    snapshot_json TEXT NOT NULL DEFAULT '{}',
                    created_at REAL NOT NULL,
                    updated_at REAL NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT,
                    event_type TEXT NOT NULL,
                    payload_json TEXT,
                    created_at REAL NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_key
                    ON events(key, created_at);
                ",
            )
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Insert or update a conversation snapshot row.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn upsert_conversation(
        &self,
        key: &str,
        model: &str,
        context_window: u64,
        phase: &str,
        total_input_tokens: u64,
        snapshot_json: &str,
    ) -> Result<()> {
        let now = unix_now();
        self.conn
            .execute(
                "INSERT INTO conversations
                    (key, model, context_window, phase, total_input_tokens,
                     snapshot_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                    phase = excluded.phase,
                    total_input_tokens = excluded.total_input_tokens,
                    snapshot_json = excluded.snapshot_json,
                    updated_at = excluded.updated_at",
                params![
                    key,
                    model,
                    context_window,
                    phase,
                    total_input_tokens,
                    snapshot_json,
                    now
                ],
            )
            .context("failed to upsert conversation")?;
        Ok(())
    }

    /// Delete a conversation row.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn delete_conversation(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM conversations WHERE key = ?1", params![key])
            .context("failed to delete conversation")?;
        Ok(())
    }

    /// Append a timestamped event.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn log_event(&self, event_type: &str, key: Option<&str>, payload_json: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO events (key, event_type, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, event_type, payload_json, unix_now()],
            )
            .context("failed to log event")?;
        Ok(())
    }

    /// List stored conversation keys with their phases, newest first.
    ///
    /// # Errors
    /// Returns an error on SQLite failure.
    pub fn list_conversations(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, phase FROM conversations ORDER BY updated_at DESC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_then_update() {
        let handle = DbHandle::new(ProxyDb::open_in_memory().unwrap());
        handle
            .call(|db| db.upsert_conversation("fp:model", "model", 200_000, "IDLE", 0, "{}"))
            .await
            .unwrap();
        handle
            .call(|db| {
                db.upsert_conversation("fp:model", "model", 200_000, "WAL_ACTIVE", 150_000, "{}")
            })
            .await
            .unwrap();

        let rows = handle.call(ProxyDb::list_conversations).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], ("fp:model".to_string(), "WAL_ACTIVE".to_string()));
    }

    #[tokio::test]
    async fn test_events_append() {
        let handle = DbHandle::new(ProxyDb::open_in_memory().unwrap());
        handle
            .call(|db| db.log_event("swap_executed", Some("fp:model"), None))
            .await
            .unwrap();
        handle
            .call(|db| db.log_event("reset", None, Some("{\"reason\":\"manual\"}")))
            .await
            .unwrap();
    }
}
