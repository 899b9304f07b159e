//! Durable key-value store used by the authority peer.
//!
//! The store only knows opaque string blobs. The merged command log is saved
//! under [`COMMANDS_KEY`] as `{ <category>: Command[] }` JSON.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use renga_types::{Category, Command};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;

/// Key of the persisted command log.
pub const COMMANDS_KEY: &str = "renga.commands";

/// Persisted log shape.
pub type CommandBlob = IndexMap<Category, Vec<Command>>;

/// Get/set of an opaque blob, synchronous from the caller's view.
pub trait KvStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn store(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Read the persisted command log; an absent key is an empty log.
pub fn load_commands(store: &dyn KvStore) -> Result<CommandBlob, StoreError> {
    match store.load(COMMANDS_KEY)? {
        Some(text) => Ok(serde_json::from_str(&text)?),
        None => Ok(CommandBlob::new()),
    }
}

pub fn store_commands(store: &dyn KvStore, blob: &CommandBlob) -> Result<(), StoreError> {
    let text = serde_json::to_string(blob)?;
    store.store(COMMANDS_KEY, &text)
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process store. Writes can be made to fail for testing error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `store` call fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KvStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// SqliteStore
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch())
);
"#;

/// SQLite-backed store with a single `settings(key, value)` table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn store(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = unixepoch()",
            params![key, value],
        )?;
        Ok(())
    }
}
