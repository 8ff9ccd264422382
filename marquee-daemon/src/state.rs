//! SQLite persistence for extension lifecycle state.
//!
//! Tables:
//! - `extension_state`: enabled flag and install position per extension id
//! - `schema_version`: Migration tracking

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use marquee_extension_host::{StateStore, StoreError, StoredState};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite-backed [`StateStore`].
///
/// The connection is wrapped in a `Mutex`; every statement is short, so calls
/// run inline on the async task.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open the database at `path`, creating it and its parent directory if
    /// needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        info!("Opening state database at: {}", path.display());

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// A throwaway database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("State database lock poisoned"))
    }

    /// Current schema version, 0 for a fresh database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .context("Failed to read schema version")
    }

    fn run_migrations(&self) -> Result<()> {
        {
            let conn = self.lock()?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY
                )",
                [],
            )
            .context("Failed to create schema_version table")?;
        }

        let current_version = self.schema_version()?;
        debug!("Current schema version: {}", current_version);

        if current_version < 1 {
            self.migrate_to_v1()?;
        }

        Ok(())
    }

    fn migrate_to_v1(&self) -> Result<()> {
        info!("Running migration to schema version 1");

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS extension_state (
                id TEXT PRIMARY KEY,
                is_enabled INTEGER NOT NULL,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create extension_state table")?;

        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_extension_state_position
             ON extension_state(position)",
            [],
        )
        .context("Failed to create position index")?;

        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .context("Failed to update schema version")?;

        tx.commit()?;
        info!("Successfully migrated to schema version 1");
        Ok(())
    }

    fn load_row(&self, id: &str) -> Result<Option<StoredState>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, is_enabled, position FROM extension_state WHERE id = ?1",
            params![id],
            row_to_state,
        )
        .optional()
        .with_context(|| format!("Failed to load state for {}", id))
    }

    fn load_rows(&self) -> Result<Vec<StoredState>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, is_enabled, position FROM extension_state ORDER BY position, id")
            .context("Failed to prepare state query")?;
        let rows = stmt
            .query_map([], row_to_state)
            .context("Failed to query extension state")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read extension state")
    }

    fn save_row(&self, state: &StoredState) -> Result<()> {
        let position = i64::try_from(state.position)
            .with_context(|| format!("Position {} out of range", state.position))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO extension_state (id, is_enabled, position, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                is_enabled = excluded.is_enabled,
                position = excluded.position,
                updated_at = excluded.updated_at",
            params![state.id, state.is_enabled, position, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to save state for {}", state.id))?;
        Ok(())
    }

    fn remove_row(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM extension_state WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to remove state for {}", id))?;
        Ok(())
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredState> {
    let position: i64 = row.get(2)?;
    Ok(StoredState {
        id: row.get(0)?,
        is_enabled: row.get(1)?,
        position: u64::try_from(position).unwrap_or_default(),
    })
}

fn store_error(err: anyhow::Error) -> StoreError {
    StoreError(format!("{:#}", err))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, id: &str) -> Result<Option<StoredState>, StoreError> {
        self.load_row(id).map_err(store_error)
    }

    async fn load_all(&self) -> Result<Vec<StoredState>, StoreError> {
        self.load_rows().map_err(store_error)
    }

    async fn save(&self, state: &StoredState) -> Result<(), StoreError> {
        self.save_row(state).map_err(store_error)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.remove_row(id).map_err(store_error)
    }
}
