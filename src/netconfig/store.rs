//! Profile catalog storage.
//!
//! The catalog is consumed through the [`ProfileStore`] trait; only the
//! read/write shape is part of the contract. Production uses SQLite, tests
//! and database-less runs use the in-memory store.

use super::NetworkProfile;
use crate::error::ProfileError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;

/// Catalog row summary, without the document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSummary {
    pub profile_id: String,
    pub tag: String,
    pub updated_at: DateTime<Utc>,
}

/// The single-row active pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePointer {
    pub profile_id: String,
    pub tag: String,
    pub updated_at: DateTime<Utc>,
}

/// Read/write shape of the profile catalog.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn list(&self) -> Result<Vec<StoredSummary>, ProfileError>;
    async fn load(&self, profile_id: &str) -> Result<Option<NetworkProfile>, ProfileError>;
    async fn save(&self, profile: &NetworkProfile) -> Result<(), ProfileError>;
    async fn active_pointer(&self) -> Result<Option<ActivePointer>, ProfileError>;
    async fn set_active(&self, pointer: &ActivePointer) -> Result<(), ProfileError>;
}

// ============================================================================
// SQLite store
// ============================================================================

/// SQLite-backed catalog. Profiles are stored as JSON documents in
/// `network_settings`; `network_settings_active` is the single-row pointer.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the catalog database and run the schema.
    pub async fn connect(path: &str) -> Result<Self, ProfileError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS network_settings (
                profile_id TEXT PRIMARY KEY,
                tag TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                document TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS network_settings_active (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                profile_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn timestamp(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn list(&self) -> Result<Vec<StoredSummary>, ProfileError> {
        let rows = sqlx::query(
            "SELECT profile_id, tag, updated_at FROM network_settings ORDER BY profile_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredSummary {
                profile_id: row.get("profile_id"),
                tag: row.get("tag"),
                updated_at: Self::timestamp(row.get("updated_at")),
            })
            .collect())
    }

    async fn load(&self, profile_id: &str) -> Result<Option<NetworkProfile>, ProfileError> {
        let row = sqlx::query("SELECT document FROM network_settings WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, profile: &NetworkProfile) -> Result<(), ProfileError> {
        let document = serde_json::to_string(profile)?;
        sqlx::query(
            "INSERT INTO network_settings (profile_id, tag, updated_at, document)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(profile_id) DO UPDATE SET
                 tag = excluded.tag,
                 updated_at = excluded.updated_at,
                 document = excluded.document",
        )
        .bind(&profile.profile_id)
        .bind(&profile.tag)
        .bind(profile.updated_at.timestamp_millis())
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_pointer(&self) -> Result<Option<ActivePointer>, ProfileError> {
        let row = sqlx::query(
            "SELECT profile_id, tag, updated_at FROM network_settings_active WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ActivePointer {
            profile_id: row.get("profile_id"),
            tag: row.get("tag"),
            updated_at: Self::timestamp(row.get("updated_at")),
        }))
    }

    async fn set_active(&self, pointer: &ActivePointer) -> Result<(), ProfileError> {
        sqlx::query(
            "INSERT INTO network_settings_active (slot, profile_id, tag, updated_at)
             VALUES (1, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                 profile_id = excluded.profile_id,
                 tag = excluded.tag,
                 updated_at = excluded.updated_at",
        )
        .bind(&pointer.profile_id)
        .bind(&pointer.tag)
        .bind(pointer.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory catalog for tests and database-less runs.
#[derive(Default)]
pub struct MemoryStore {
    profiles: Mutex<HashMap<String, NetworkProfile>>,
    active: Mutex<Option<ActivePointer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn list(&self) -> Result<Vec<StoredSummary>, ProfileError> {
        let mut summaries: Vec<StoredSummary> = self
            .profiles
            .lock()
            .values()
            .map(|p| StoredSummary {
                profile_id: p.profile_id.clone(),
                tag: p.tag.clone(),
                updated_at: p.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(summaries)
    }

    async fn load(&self, profile_id: &str) -> Result<Option<NetworkProfile>, ProfileError> {
        Ok(self.profiles.lock().get(profile_id).cloned())
    }

    async fn save(&self, profile: &NetworkProfile) -> Result<(), ProfileError> {
        self.profiles
            .lock()
            .insert(profile.profile_id.clone(), profile.clone());
        Ok(())
    }

    async fn active_pointer(&self) -> Result<Option<ActivePointer>, ProfileError> {
        Ok(self.active.lock().clone())
    }

    async fn set_active(&self, pointer: &ActivePointer) -> Result<(), ProfileError> {
        *self.active.lock() = Some(pointer.clone());
        Ok(())
    }
}
