//! Key/value persistence used to snapshot queue state across restarts.

use crate::config::{StorageBackend, StorageConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SQLITE_FILE_NAME: &str = "outpost.db";

/// Synchronous object store.
///
/// Callers treat every error as best-effort: a failed read means "nothing
/// stored", a failed write leaves in-memory state authoritative.
pub trait PersistentStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn get_object(&self, key: &str) -> Result<Option<Value>>;

    fn set_object(&self, key: &str, value: &Value) -> Result<()>;
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_object(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set_object(&self, key: &str, value: &Value) -> Result<()> {
        self.data.lock().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// SQLite-backed store holding JSON documents in a single `kv` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create storage directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open store DB: {}", self.db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );",
        )
        .context("Failed to initialize store schema")?;

        f(&conn)
    }
}

impl PersistentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get_object(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read stored object")
        })?;

        raw.map(|text| {
            serde_json::from_str(&text)
                .with_context(|| format!("Stored object '{key}' is not valid JSON"))
        })
        .transpose()
    }

    fn set_object(&self, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, Utc::now().to_rfc3339()],
            )
            .context("Failed to write stored object")?;
            Ok(())
        })
    }
}

/// Build the store selected by `[storage]`.
pub fn create_store(config: &StorageConfig, state_dir: &Path) -> Arc<dyn PersistentStore> {
    match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| state_dir.join(SQLITE_FILE_NAME));
            Arc::new(SqliteStore::new(path))
        }
    }
}
