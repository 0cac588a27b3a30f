use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::{KeyValueStore, Result, StoreError};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Key-value store backed by a migrated SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::migrate(conn, Some(path.to_path_buf()))?;
        tracing::info!("Settings database initialized at {:?}", path);
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::migrate(Connection::open_in_memory()?, None)
    }

    fn migrate(mut conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        embedded::migrations::runner().run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// All stored settings, ordered by key.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value],
        )?;

        tracing::debug!("Setting saved: {} = {}", key, value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        tracing::debug!("Setting deleted: {}", key);
        Ok(())
    }
}
