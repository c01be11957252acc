//! Database query functions for the `task_state` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{TaskState, TaskStatus};

/// Ensure a task row exists in `pending` status.
///
/// `ON CONFLICT DO NOTHING` makes this idempotent across orchestrator
/// restarts; existing rows (including completed ones) are left untouched.
pub async fn ensure_task(pool: &SqlitePool, workflow_id: &str, task_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_state (workflow_id, task_id, status) \
         VALUES ($1, $2, 'pending') \
         ON CONFLICT (workflow_id, task_id) DO NOTHING",
    )
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to insert task state")?;

    Ok(())
}

/// Fetch a single task's state.
pub async fn get_task(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
) -> Result<Option<TaskState>> {
    let row = sqlx::query_as::<_, TaskState>(
        "SELECT * FROM task_state WHERE workflow_id = $1 AND task_id = $2",
    )
    .bind(workflow_id)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch task state")?;

    Ok(row)
}

/// List all task states for a workflow, in insertion order.
pub async fn list_tasks(pool: &SqlitePool, workflow_id: &str) -> Result<Vec<TaskState>> {
    let rows = sqlx::query_as::<_, TaskState>(
        "SELECT * FROM task_state WHERE workflow_id = $1 ORDER BY rowid ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list task states")?;

    Ok(rows)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did not
/// match).
pub async fn transition_task_status(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_state \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE workflow_id = $4 AND task_id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(workflow_id)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically begin an execution attempt: transition to `running` and
/// increment the attempt counter. Uses optimistic locking on both the
/// expected status and the current attempt value.
pub async fn begin_task_attempt(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    from: TaskStatus,
    current_attempt: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_state \
         SET status = 'running', \
             attempt = attempt + 1, \
             timed_out = 0, \
             started_at = $1, \
             completed_at = NULL \
         WHERE workflow_id = $2 AND task_id = $3 AND status = $4 AND attempt = $5",
    )
    .bind(Utc::now())
    .bind(workflow_id)
    .bind(task_id)
    .bind(from)
    .bind(current_attempt)
    .execute(pool)
    .await
    .context("failed to begin task attempt")?;

    Ok(result.rows_affected())
}

/// Record the success payload of a completed task.
pub async fn set_task_result(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    result: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_state SET result = $1, error = NULL \
         WHERE workflow_id = $2 AND task_id = $3",
    )
    .bind(result)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task result")?;

    Ok(())
}

/// Record the last error message on a task, with the timed-out flag.
pub async fn set_task_error(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    error: &str,
    timed_out: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_state SET error = $1, timed_out = $2 \
         WHERE workflow_id = $3 AND task_id = $4",
    )
    .bind(error)
    .bind(timed_out)
    .bind(workflow_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task error")?;

    Ok(())
}

/// Reset tasks stuck in `running` back to `failed` so restart recovery can
/// decide whether to retry or give up.
///
/// If the orchestrator crashes mid-run, in-progress tasks are left in
/// limbo; their side effects are protected by the outbox either way.
/// Returns the tasks that were reset.
pub async fn reset_orphaned_tasks(pool: &SqlitePool, workflow_id: &str) -> Result<Vec<TaskState>> {
    let tasks = sqlx::query_as::<_, TaskState>(
        "UPDATE task_state \
         SET status = 'failed', completed_at = $1 \
         WHERE workflow_id = $2 AND status = 'running' \
         RETURNING *",
    )
    .bind(Utc::now())
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    Ok(tasks)
}

/// Put a failed task back in the scheduler's path: transition to `pending`
/// while preserving the attempt counter, so the remaining attempt budget is
/// honored. Optimistic on status and attempt. Returns rows affected.
pub async fn reset_task_to_pending(
    pool: &SqlitePool,
    workflow_id: &str,
    task_id: &str,
    current_attempt: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_state \
         SET status = 'pending', started_at = NULL, completed_at = NULL \
         WHERE workflow_id = $1 AND task_id = $2 \
           AND status = 'failed' AND attempt = $3",
    )
    .bind(workflow_id)
    .bind(task_id)
    .bind(current_attempt)
    .execute(pool)
    .await
    .context("failed to reset task to pending")?;

    Ok(result.rows_affected())
}

/// Reset non-completed tasks of a failed workflow back to `pending` with a
/// fresh attempt budget, so the workflow can be re-executed. Completed tasks
/// are left untouched (they are never re-executed).
///
/// Returns the number of tasks reset.
pub async fn reset_tasks_for_rerun(pool: &SqlitePool, workflow_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_state \
         SET status = 'pending', \
             attempt = 0, \
             result = NULL, \
             error = NULL, \
             timed_out = 0, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE workflow_id = $1 \
           AND status IN ('failed', 'timeout', 'skipped', 'running')",
    )
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("failed to reset tasks for re-run")?;

    Ok(result.rows_affected())
}
