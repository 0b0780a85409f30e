// Credential persistence
// Pluggable store keyed by session identity; a session may run without one

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::OptionalExtension;
use std::path::{Path, PathBuf};

use super::types::CredentialPair;
use crate::error::{AuthError, Result};

/// Durable storage for credential pairs
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored pair for `identity`, if any
    async fn read(&self, identity: &str) -> Result<Option<CredentialPair>>;

    /// Persist `pair` for `identity`, replacing any previous record
    async fn save(&self, identity: &str, pair: &CredentialPair) -> Result<()>;

    /// Remove the record for `identity`; clearing a missing record succeeds
    async fn clear(&self, identity: &str) -> Result<()>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, CredentialPair>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn read(&self, identity: &str) -> Result<Option<CredentialPair>> {
        Ok(self.records.get(identity).map(|entry| entry.value().clone()))
    }

    async fn save(&self, identity: &str, pair: &CredentialPair) -> Result<()> {
        self.records.insert(identity.to_string(), pair.clone());
        Ok(())
    }

    async fn clear(&self, identity: &str) -> Result<()> {
        self.records.remove(identity);
        Ok(())
    }
}

/// SQLite-backed store; one JSON row per identity
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        let conn = store.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                identity   TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )?;
        tracing::debug!("Credential store ready: {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(|e| {
            AuthError::Store(format!(
                "Failed to open SQLite database {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Run a blocking database operation off the async executor
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store.connect()?))
            .await
            .map_err(|e| AuthError::Store(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn read(&self, identity: &str) -> Result<Option<CredentialPair>> {
        let identity = identity.to_string();
        self.with_connection(move |conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM credentials WHERE identity = ?",
                    [&identity],
                    |row| row.get(0),
                )
                .optional()?;

            value
                .map(|json| {
                    serde_json::from_str::<CredentialPair>(&json).map_err(|e| {
                        AuthError::Store(format!(
                            "Failed to parse stored credentials for {}: {}",
                            identity, e
                        ))
                    })
                })
                .transpose()
        })
        .await
    }

    async fn save(&self, identity: &str, pair: &CredentialPair) -> Result<()> {
        let identity = identity.to_string();
        let json = serde_json::to_string(pair)
            .map_err(|e| AuthError::Store(format!("Failed to encode credentials: {}", e)))?;

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO credentials (identity, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(identity) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![identity, json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, identity: &str) -> Result<()> {
        let identity = identity.to_string();
        self.with_connection(move |conn| {
            conn.execute("DELETE FROM credentials WHERE identity = ?", [&identity])?;
            Ok(())
        })
        .await
    }
}
