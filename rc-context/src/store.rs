//! Byte-keyed record storage backing the context engine.

use crate::error::{ContextError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Durable key-value store with ordered prefix scans.
///
/// Implementations are internally synchronized; the engine shares one
/// instance across every dispatcher task.
pub trait ConversationStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Every entry in the store, in key order.
    fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// `None` when no such bound exists (empty or all-0xff prefix).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn poisoned(what: &str) -> ContextError {
    ContextError::Storage(format!("{what} lock poisoned"))
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ContextError::Storage(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(
        &self,
        sql: &str,
        bounds: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock().map_err(|_| poisoned("sqlite"))?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(bounds, |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl ConversationStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().map_err(|_| poisoned("sqlite"))?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned("sqlite"))?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match prefix_upper_bound(prefix) {
            Some(end) => self.query(
                "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                &[&prefix, &end],
            ),
            None => self.query(
                "SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key",
                &[&prefix],
            ),
        }
    }

    fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.query("SELECT key, value FROM kv ORDER BY key", &[])
    }
}

/// Process-local store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| poisoned("memory store"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("memory store"))?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| poisoned("memory store"))?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| poisoned("memory store"))?;
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
