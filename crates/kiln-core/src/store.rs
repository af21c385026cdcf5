//! Persistent artifact storage keyed by model name.
//!
//! # Schema
//!
//! ```text
//! models
//! ├── name         TEXT PRIMARY KEY   models/<hex digest>
//! ├── fingerprint  TEXT               full-width program digest
//! ├── module       BLOB               loadable module image
//! ├── diagnostics  TEXT               captured build output
//! └── created_at   INTEGER            unix seconds
//! ```
//!
//! Writes are single-statement upserts inside a transaction, so a reader
//! sees either the previous artifact or the new one, never a mix. Losing
//! the most recent write in a crash only costs a rebuild.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;

use crate::compile::CompiledArtifact;
use crate::error::{Error, Result};
use crate::naming::ModelName;

/// How long a writer waits on a database locked by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// An artifact together with the fingerprint of the program that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub artifact: CompiledArtifact,
    pub fingerprint: String,
}

/// Key → artifact store. Implementations must be safe to share across threads.
pub trait ArtifactStore: Send + Sync {
    /// Look up an artifact. `Ok(None)` on a miss; never builds anything.
    fn get(&self, name: &ModelName) -> Result<Option<StoredArtifact>>;

    /// Insert or replace the artifact stored under `name`.
    fn put(&self, name: &ModelName, fingerprint: &str, artifact: &CompiledArtifact) -> Result<()>;

    /// All stored model names, sorted.
    fn list(&self) -> Result<Vec<ModelName>>;

    /// Remove an artifact. Returns whether one was stored.
    fn delete(&self, name: &ModelName) -> Result<bool>;
}

/// SQLite-backed artifact store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!("Opened artifact store at {} (journal_mode={})", path.display(), mode);

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// A private store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS models (
                name        TEXT PRIMARY KEY NOT NULL,
                fingerprint TEXT NOT NULL,
                module      BLOB NOT NULL,
                diagnostics TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection lock poisoned".to_string()))
    }
}

impl ArtifactStore for SqliteStore {
    fn get(&self, name: &ModelName) -> Result<Option<StoredArtifact>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT fingerprint, module, diagnostics FROM models WHERE name = ?1",
                params![name.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(fingerprint, module, diagnostics)| StoredArtifact {
            artifact: CompiledArtifact::new(module, diagnostics),
            fingerprint,
        }))
    }

    fn put(&self, name: &ModelName, fingerprint: &str, artifact: &CompiledArtifact) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO models (name, fingerprint, module, diagnostics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                module = excluded.module,
                diagnostics = excluded.diagnostics,
                created_at = excluded.created_at",
            params![
                name.as_str(),
                fingerprint,
                &artifact.binary[..],
                artifact.diagnostics,
                unix_now(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!("Stored {} ({} bytes)", name, artifact.binary.len());
        Ok(())
    }

    fn list(&self) -> Result<Vec<ModelName>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM models ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for row in rows {
            let text = row?;
            match ModelName::parse(&text) {
                Ok(name) => names.push(name),
                Err(_) => tracing::warn!("Skipping malformed model name in store: {}", text),
            }
        }
        Ok(names)
    }

    fn delete(&self, name: &ModelName) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM models WHERE name = ?1", params![name.as_str()])?;
        Ok(removed > 0)
    }
}

/// In-process artifact store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<FxHashMap<ModelName, StoredArtifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::Store("memory store lock poisoned".to_string())
}

impl ArtifactStore for MemoryStore {
    fn get(&self, name: &ModelName) -> Result<Option<StoredArtifact>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(name).cloned())
    }

    fn put(&self, name: &ModelName, fingerprint: &str, artifact: &CompiledArtifact) -> Result<()> {
        self.entries.write().map_err(|_| poisoned())?.insert(
            name.clone(),
            StoredArtifact {
                artifact: artifact.clone(),
                fingerprint: fingerprint.to_string(),
            },
        );
        Ok(())
    }

    fn list(&self) -> Result<Vec<ModelName>> {
        let mut names: Vec<_> = self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &ModelName) -> Result<bool> {
        Ok(self
            .entries
            .write()
            .map_err(|_| poisoned())?
            .remove(name)
            .is_some())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
