//! Persistence of app definitions
//!
//! The manager only needs to save a definition at creation time and load it
//! back when a request arrives for an app with no live instance. Two
//! backends are provided: an in-memory map and a SQLite database.

use crate::app::AppDefinition;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// Result of looking up a stored definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredApp {
    Found(AppDefinition),
    Expired,
    NotFound,
}

/// Key-value persistence for app definitions
pub trait AppStore: Send + Sync {
    fn save(&self, def: &AppDefinition) -> Result<()>;

    /// Load a definition, classifying it against `now`
    fn load(&self, app_id: &str, now: DateTime<Utc>) -> Result<StoredApp>;

    /// Returns whether a definition was removed
    fn remove(&self, app_id: &str) -> Result<bool>;

    /// Drop every definition that expired before `now`, returning the count
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

fn classify(def: AppDefinition, now: DateTime<Utc>) -> StoredApp {
    if def.is_expired(now) {
        StoredApp::Expired
    } else {
        StoredApp::Found(def)
    }
}

/// Definitions kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    apps: DashMap<String, AppDefinition>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl AppStore for MemoryStore {
    fn save(&self, def: &AppDefinition) -> Result<()> {
        self.apps.insert(def.app_id.clone(), def.clone());
        Ok(())
    }

    fn load(&self, app_id: &str, now: DateTime<Utc>) -> Result<StoredApp> {
        Ok(match self.apps.get(app_id) {
            Some(entry) => classify(entry.value().clone(), now),
            None => StoredApp::NotFound,
        })
    }

    fn remove(&self, app_id: &str) -> Result<bool> {
        Ok(self.apps.remove(app_id).is_some())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.apps.len();
        self.apps.retain(|_, def| !def.is_expired(now));
        Ok(before.saturating_sub(self.apps.len()))
    }
}

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Definitions kept in a SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("App store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: app definitions
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: app definitions");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS app_definitions (
                app_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_app_definitions_expires_at
                ON app_definitions(expires_at);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM app_definitions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl AppStore for SqliteStore {
    fn save(&self, def: &AppDefinition) -> Result<()> {
        let json = serde_json::to_string(def)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO app_definitions (app_id, user_id, definition, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                def.app_id,
                def.user_id,
                json,
                def.created_at.to_rfc3339(),
                def.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn load(&self, app_id: &str, now: DateTime<Utc>) -> Result<StoredApp> {
        let json: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT definition FROM app_definitions WHERE app_id = ?1",
                params![app_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match json {
            Some(json) => {
                let def: AppDefinition = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt definition for app '{}'", app_id))?;
                Ok(classify(def, now))
            }
            None => Ok(StoredApp::NotFound),
        }
    }

    fn remove(&self, app_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM app_definitions WHERE app_id = ?1", params![app_id])?;
        Ok(rows > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM app_definitions WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(rows)
    }
}
