//! Versioned world state with optimistic concurrency.
//!
//! Each key carries a strictly monotonic version; updates and deletes must
//! present the expected version and fail with a [`WorldStateError::Conflict`]
//! -- mutating nothing -- when it is stale. The orchestrator brackets each
//! task with [`WorldStateStore::snapshot`] / [`WorldStateStore::diff`] to
//! emit `state_snapshot` and `state_updated` events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;

use windlass_db::models::WorldEntry;
use windlass_db::queries::world as db;

/// Errors surfaced by the world-state store.
#[derive(Debug, Error)]
pub enum WorldStateError {
    #[error("version conflict on {key:?}: expected {expected}, actual {actual}")]
    Conflict {
        key: String,
        expected: i64,
        actual: i64,
        /// The value whose write was refused.
        attempted: Value,
    },

    #[error("world-state key {0:?} not found")]
    NotFound(String),

    #[error("world-state key {0:?} already exists")]
    AlreadyExists(String),

    #[error("world-state storage error: {0}")]
    Storage(anyhow::Error),
}

impl WorldStateError {
    fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// The kind of change a diff entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOperation {
    Create,
    Update,
    Delete,
}

/// One changed key between a snapshot and now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub operation: DiffOperation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_before: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_after: Option<i64>,
}

/// An ordered list of per-key changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldStateDiff {
    pub entries: Vec<DiffEntry>,
}

impl WorldStateDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A point-in-time map of key -> version.
pub type WorldSnapshot = BTreeMap<String, i64>;

/// A record of a conflict observed during a task, attached to the task's
/// event metadata for later analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub key: String,
    pub expected: i64,
    pub actual: i64,
}

/// The versioned key-value store.
pub struct WorldStateStore {
    pool: SqlitePool,
    // Conflicts since the last drain; reported on state_updated events but
    // never failing the task.
    conflicts: Mutex<Vec<ConflictRecord>>,
}

impl WorldStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            conflicts: Mutex::new(Vec::new()),
        }
    }

    /// Create a key at version 1.
    pub async fn create(&self, key: &str, value: Value) -> Result<WorldEntry, WorldStateError> {
        let rows = db::create_entry(&self.pool, key, &value)
            .await
            .map_err(WorldStateError::storage)?;
        if rows == 0 {
            return Err(WorldStateError::AlreadyExists(key.to_owned()));
        }
        self.read(key).await
    }

    /// Read the current value and version of a key.
    pub async fn read(&self, key: &str) -> Result<WorldEntry, WorldStateError> {
        db::get_entry(&self.pool, key)
            .await
            .map_err(WorldStateError::storage)?
            .ok_or_else(|| WorldStateError::NotFound(key.to_owned()))
    }

    /// Read a specific historical version of a key.
    pub async fn read_version(
        &self,
        key: &str,
        version: i64,
    ) -> Result<WorldEntry, WorldStateError> {
        db::get_entry_version(&self.pool, key, version)
            .await
            .map_err(WorldStateError::storage)?
            .ok_or_else(|| WorldStateError::NotFound(key.to_owned()))
    }

    /// Update a key iff `expected_version` matches; the new version is
    /// `expected_version + 1`.
    pub async fn update(
        &self,
        key: &str,
        value: Value,
        expected_version: i64,
    ) -> Result<WorldEntry, WorldStateError> {
        let rows = db::update_entry(&self.pool, key, &value, expected_version)
            .await
            .map_err(WorldStateError::storage)?;
        if rows == 0 {
            return Err(self.conflict_for(key, expected_version, value).await?);
        }
        self.read(key).await
    }

    /// Delete a key iff `expected_version` matches. History is retained.
    pub async fn delete(&self, key: &str, expected_version: i64) -> Result<(), WorldStateError> {
        let rows = db::delete_entry(&self.pool, key, expected_version)
            .await
            .map_err(WorldStateError::storage)?;
        if rows == 0 {
            return Err(self
                .conflict_for(key, expected_version, Value::Null)
                .await?);
        }
        Ok(())
    }

    /// Build the conflict (or not-found) error for a refused write, and
    /// record it for event metadata.
    async fn conflict_for(
        &self,
        key: &str,
        expected: i64,
        attempted: Value,
    ) -> Result<WorldStateError, WorldStateError> {
        let current = db::get_entry(&self.pool, key)
            .await
            .map_err(WorldStateError::storage)?;
        match current {
            None => Ok(WorldStateError::NotFound(key.to_owned())),
            Some(entry) => {
                self.conflicts.lock().await.push(ConflictRecord {
                    key: key.to_owned(),
                    expected,
                    actual: entry.version,
                });
                Ok(WorldStateError::Conflict {
                    key: key.to_owned(),
                    expected,
                    actual: entry.version,
                    attempted,
                })
            }
        }
    }

    /// Capture the current key -> version map.
    pub async fn snapshot(&self) -> Result<WorldSnapshot, WorldStateError> {
        let entries = db::list_entries(&self.pool)
            .await
            .map_err(WorldStateError::storage)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.key, e.version))
            .collect())
    }

    /// The current key -> value map (for feasibility checks).
    pub async fn dump(&self) -> Result<BTreeMap<String, Value>, WorldStateError> {
        let entries = db::list_entries(&self.pool)
            .await
            .map_err(WorldStateError::storage)?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }

    /// Compare a snapshot against the present state, one diff entry per
    /// changed key, ordered by key.
    pub async fn diff(&self, snapshot: &WorldSnapshot) -> Result<WorldStateDiff, WorldStateError> {
        let current = db::list_entries(&self.pool)
            .await
            .map_err(WorldStateError::storage)?;
        let current_by_key: BTreeMap<&str, &WorldEntry> =
            current.iter().map(|e| (e.key.as_str(), e)).collect();

        let mut entries = Vec::new();

        for (key, entry) in &current_by_key {
            match snapshot.get(*key) {
                None => entries.push(DiffEntry {
                    operation: DiffOperation::Create,
                    key: (*key).to_owned(),
                    before: None,
                    after: Some(entry.value.clone()),
                    version_before: None,
                    version_after: Some(entry.version),
                }),
                Some(&snap_version) if snap_version != entry.version => {
                    let before = db::get_entry_version(&self.pool, key, snap_version)
                        .await
                        .map_err(WorldStateError::storage)?
                        .map(|e| e.value);
                    entries.push(DiffEntry {
                        operation: DiffOperation::Update,
                        key: (*key).to_owned(),
                        before,
                        after: Some(entry.value.clone()),
                        version_before: Some(snap_version),
                        version_after: Some(entry.version),
                    });
                }
                Some(_) => {}
            }
        }

        for (key, &snap_version) in snapshot {
            if !current_by_key.contains_key(key.as_str()) {
                let before = db::get_entry_version(&self.pool, key, snap_version)
                    .await
                    .map_err(WorldStateError::storage)?
                    .map(|e| e.value);
                entries.push(DiffEntry {
                    operation: DiffOperation::Delete,
                    key: key.clone(),
                    before,
                    after: None,
                    version_before: Some(snap_version),
                    version_after: None,
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(WorldStateDiff { entries })
    }

    /// Drain the conflicts recorded since the last drain.
    pub async fn take_conflicts(&self) -> Vec<ConflictRecord> {
        std::mem::take(&mut *self.conflicts.lock().await)
    }
}
