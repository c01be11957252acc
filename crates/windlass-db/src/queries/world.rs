//! Database query functions for the `world_state` and `world_state_history`
//! tables.
//!
//! `world_state` holds the current value per key; every write also lands in
//! `world_state_history`, which deletes never touch. Version checks use
//! optimistic `WHERE version = $expected` updates; the caller maps a zero
//! row count to a conflict.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::WorldEntry;

/// Insert a new key at version 1. Returns rows affected (0 when the key
/// already exists).
pub async fn create_entry(
    pool: &SqlitePool,
    key: &str,
    value: &serde_json::Value,
) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let res = sqlx::query(
        "INSERT INTO world_state (key, version, value, updated_at) \
         VALUES ($1, 1, $2, $3) \
         ON CONFLICT (key) DO NOTHING",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to insert world-state entry")?;

    if res.rows_affected() == 1 {
        sqlx::query(
            "INSERT INTO world_state_history (key, version, value, updated_at) \
             VALUES ($1, 1, $2, $3)",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert world-state history row")?;
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(res.rows_affected())
}

/// Fetch the current entry for a key.
pub async fn get_entry(pool: &SqlitePool, key: &str) -> Result<Option<WorldEntry>> {
    let row = sqlx::query_as::<_, WorldEntry>("SELECT * FROM world_state WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch world-state entry")?;

    Ok(row)
}

/// Fetch a specific historical version of a key.
pub async fn get_entry_version(
    pool: &SqlitePool,
    key: &str,
    version: i64,
) -> Result<Option<WorldEntry>> {
    let row = sqlx::query_as::<_, WorldEntry>(
        "SELECT * FROM world_state_history WHERE key = $1 AND version = $2",
    )
    .bind(key)
    .bind(version)
    .fetch_optional(pool)
    .await
    .context("failed to fetch world-state history entry")?;

    Ok(row)
}

/// Atomically bump a key to a new value iff its current version matches
/// `expected_version`. Returns rows affected (0 on version mismatch or
/// missing key); on success the new version is `expected_version + 1`.
pub async fn update_entry(
    pool: &SqlitePool,
    key: &str,
    value: &serde_json::Value,
    expected_version: i64,
) -> Result<u64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let res = sqlx::query(
        "UPDATE world_state \
         SET version = version + 1, value = $1, updated_at = $2 \
         WHERE key = $3 AND version = $4",
    )
    .bind(value)
    .bind(now)
    .bind(key)
    .bind(expected_version)
    .execute(&mut *tx)
    .await
    .context("failed to update world-state entry")?;

    if res.rows_affected() == 1 {
        sqlx::query(
            "INSERT INTO world_state_history (key, version, value, updated_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(key)
        .bind(expected_version + 1)
        .bind(value)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to insert world-state history row")?;
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(res.rows_affected())
}

/// Remove the current row for a key iff its version matches. History rows
/// are retained. Returns rows affected (0 on version mismatch).
pub async fn delete_entry(pool: &SqlitePool, key: &str, expected_version: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM world_state WHERE key = $1 AND version = $2")
        .bind(key)
        .bind(expected_version)
        .execute(pool)
        .await
        .context("failed to delete world-state entry")?;

    Ok(res.rows_affected())
}

/// List every current entry, ordered by key.
pub async fn list_entries(pool: &SqlitePool) -> Result<Vec<WorldEntry>> {
    let rows = sqlx::query_as::<_, WorldEntry>("SELECT * FROM world_state ORDER BY key ASC")
        .fetch_all(pool)
        .await
        .context("failed to list world-state entries")?;

    Ok(rows)
}
