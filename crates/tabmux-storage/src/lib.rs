//! Key/value persistence tiers.
//!
//! The durable tier lives as long as the browser profile. The session tier is
//! stamped with a browser-session marker and wiped when a different marker
//! opens it, so it survives the host process being restarted but not the
//! browser itself.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

pub const KV_SCHEMA_VERSION: i64 = 1;

const SESSION_MARKER_KEY: &str = "session_marker";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("storage lock poisoned")]
    Poisoned,
}

pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

pub struct SqliteArea {
    conn: Mutex<Connection>,
}

impl SqliteArea {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let area = Self {
            conn: Mutex::new(conn),
        };
        area.migrate()?;
        Ok(area)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let area = Self {
            conn: Mutex::new(conn),
        };
        area.migrate()?;
        Ok(area)
    }

    /// Opens a session-scoped area. Entries written under a different
    /// `marker` are discarded before the area is handed out.
    pub fn open_session(path: impl AsRef<Path>, marker: &str) -> Result<Self, StorageError> {
        let area = Self::open(path)?;
        area.claim_session(marker)?;
        Ok(area)
    }

    fn claim_session(&self, marker: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let previous: Option<String> = conn
            .query_row(
                "SELECT value FROM area_meta WHERE name = ?1",
                params![SESSION_MARKER_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if previous.as_deref() == Some(marker) {
            return Ok(());
        }
        conn.execute("DELETE FROM kv", [])?;
        conn.execute(
            "INSERT INTO area_meta (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![SESSION_MARKER_KEY, marker],
        )?;
        info!(
            event = "session_area_reset",
            previous = previous.as_deref().unwrap_or(""),
            marker
        );
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > KV_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: KV_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
            conn.execute_batch(include_str!("../migrations/0001_kv_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }
}

impl StorageArea for SqliteArea {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArea {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageArea for MemoryArea {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.clear();
        Ok(())
    }
}
