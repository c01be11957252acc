//! Database query functions for the `outbox` table.
//!
//! The outbox is the intent log for external side effects. Rows are keyed by
//! `(workflow_id, idempotency_key)`; state transitions use optimistic
//! `WHERE state = $expected` updates so concurrent executors cannot double-
//! process an entry.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{OutboxEntry, OutboxState};

/// Parameters for a new outbox entry.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry<'a> {
    pub workflow_id: &'a str,
    pub task_id: &'a str,
    pub tool_id: &'a str,
    pub params: &'a serde_json::Value,
    pub idempotency_key: &'a str,
    pub max_attempts: i64,
}

/// Insert an outbox entry if no entry with the same
/// `(workflow_id, idempotency_key)` exists, and return the stored entry
/// either way.
///
/// This is the replay-protection primitive: storing the same intent twice
/// returns the original row unchanged.
pub async fn store_entry(pool: &SqlitePool, new: &NewOutboxEntry<'_>) -> Result<OutboxEntry> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO outbox \
         (id, workflow_id, task_id, tool_id, params, idempotency_key, \
          state, attempts, max_attempts, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $8) \
         ON CONFLICT (workflow_id, idempotency_key) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(new.workflow_id)
    .bind(new.task_id)
    .bind(new.tool_id)
    .bind(new.params)
    .bind(new.idempotency_key)
    .bind(new.max_attempts)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert outbox entry")?;

    get_by_key(pool, new.workflow_id, new.idempotency_key)
        .await?
        .with_context(|| {
            format!(
                "outbox entry for key {} missing after insert",
                new.idempotency_key
            )
        })
}

/// Fetch an entry by `(workflow_id, idempotency_key)`.
pub async fn get_by_key(
    pool: &SqlitePool,
    workflow_id: &str,
    idempotency_key: &str,
) -> Result<Option<OutboxEntry>> {
    let row = sqlx::query_as::<_, OutboxEntry>(
        "SELECT * FROM outbox WHERE workflow_id = $1 AND idempotency_key = $2",
    )
    .bind(workflow_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch outbox entry by key")?;

    Ok(row)
}

/// Fetch an entry by id.
pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<OutboxEntry>> {
    let row = sqlx::query_as::<_, OutboxEntry>("SELECT * FROM outbox WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch outbox entry by id")?;

    Ok(row)
}

/// Atomically claim an entry for processing: transition from `$from` to
/// `processing` and increment the attempt counter. Returns rows affected
/// (0 means the state did not match).
pub async fn mark_processing(pool: &SqlitePool, id: Uuid, from: OutboxState) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE outbox \
         SET state = 'processing', attempts = attempts + 1, updated_at = $1 \
         WHERE id = $2 AND state = $3",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to mark outbox entry processing")?;

    Ok(result.rows_affected())
}

/// Commit an entry: record the result payload and the commit timestamp.
/// Only a `processing` entry can commit. Returns rows affected.
pub async fn mark_committed(
    pool: &SqlitePool,
    id: Uuid,
    result: &serde_json::Value,
) -> Result<u64> {
    let now = Utc::now();
    let res = sqlx::query(
        "UPDATE outbox \
         SET state = 'committed', result = $1, error = NULL, \
             updated_at = $2, committed_at = $2 \
         WHERE id = $3 AND state = 'processing'",
    )
    .bind(result)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to commit outbox entry")?;

    Ok(res.rows_affected())
}

/// Fail an entry: record the error and move to `failed` or `dead_letter`.
/// Only a `processing` entry can fail. Returns rows affected.
pub async fn mark_failed(
    pool: &SqlitePool,
    id: Uuid,
    error: &str,
    to: OutboxState,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE outbox \
         SET state = $1, error = $2, updated_at = $3 \
         WHERE id = $4 AND state = 'processing'",
    )
    .bind(to)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark outbox entry failed")?;

    Ok(res.rows_affected())
}

/// Revive an entry back to `pending` (reconciliation of stuck or retryable
/// entries). Returns rows affected (0 means the state no longer matches).
pub async fn reset_to_pending(pool: &SqlitePool, id: Uuid, from: OutboxState) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE outbox SET state = 'pending', updated_at = $1 \
         WHERE id = $2 AND state = $3",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to reset outbox entry to pending")?;

    Ok(res.rows_affected())
}

/// Administrative revival for workflow re-execution: reset a workflow's
/// `failed` and `dead_letter` entries to `pending` with a fresh attempt
/// budget. Committed entries are left untouched so replay protection holds
/// across runs. Returns rows affected.
pub async fn revive_for_workflow(pool: &SqlitePool, workflow_id: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE outbox \
         SET state = 'pending', attempts = 0, error = NULL, updated_at = $1 \
         WHERE workflow_id = $2 AND state IN ('failed', 'dead_letter')",
    )
    .bind(Utc::now())
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("failed to revive outbox entries for workflow")?;

    Ok(res.rows_affected())
}

/// List entries in non-terminal states (`pending`, `processing`, `failed`),
/// oldest first.
pub async fn list_non_terminal(pool: &SqlitePool) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query_as::<_, OutboxEntry>(
        "SELECT * FROM outbox \
         WHERE state IN ('pending', 'processing', 'failed') \
         ORDER BY rowid ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list non-terminal outbox entries")?;

    Ok(rows)
}

/// List all committed entries, oldest first.
pub async fn list_committed(pool: &SqlitePool) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query_as::<_, OutboxEntry>(
        "SELECT * FROM outbox WHERE state = 'committed' ORDER BY rowid ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list committed outbox entries")?;

    Ok(rows)
}

/// Delete entries by id. Returns the number of rows removed.
pub async fn delete_entries(pool: &SqlitePool, ids: &[Uuid]) -> Result<u64> {
    let mut removed = 0u64;
    for id in ids {
        let res = sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete outbox entry")?;
        removed += res.rows_affected();
    }
    Ok(removed)
}
