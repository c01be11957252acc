//! Task state machine transitions.
//!
//! Validates and executes task state transitions against the store,
//! enforcing the allowed transition graph, optimistic locking, timestamp
//! management, and the attempt counter.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;

use windlass_db::models::{TaskState, TaskStatus};
use windlass_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending -> running
/// running -> completed
/// running -> failed
/// running -> timeout
/// failed  -> running   (retry, attempt + 1)
/// timeout -> running   (retry, attempt + 1)
/// pending -> skipped
/// ```
pub struct TaskLifecycle;

impl TaskLifecycle {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
                | (TaskStatus::Failed, TaskStatus::Running)
                | (TaskStatus::Timeout, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Skipped)
        )
    }

    /// Begin an execution attempt: transition into `running` and increment
    /// the attempt counter, with optimistic locking on both the expected
    /// status and the expected attempt value.
    ///
    /// Returns the 1-based attempt number that just started.
    pub async fn begin_attempt(
        pool: &SqlitePool,
        workflow_id: &str,
        task_id: &str,
        expected: &TaskState,
    ) -> Result<u32> {
        if !Self::is_valid_transition(expected.status, TaskStatus::Running) {
            bail!(
                "invalid state transition: {} -> running for task {}",
                expected.status,
                task_id
            );
        }

        let rows = db::begin_task_attempt(
            pool,
            workflow_id,
            task_id,
            expected.status,
            expected.attempt,
        )
        .await?;

        if rows == 0 {
            let current = db::get_task(pool, workflow_id, task_id).await?;
            match current {
                None => bail!("task {} not found in workflow {}", task_id, workflow_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {} attempt {}, expected {} attempt {}",
                    task_id,
                    t.status,
                    t.attempt,
                    expected.status,
                    expected.attempt
                ),
            }
        }

        Ok((expected.attempt + 1) as u32)
    }

    /// Execute a non-retry state transition with optimistic locking.
    ///
    /// Sets `completed_at` when transitioning to `completed`, `failed`,
    /// `timeout`, or `skipped`.
    pub async fn transition(
        pool: &SqlitePool,
        workflow_id: &str,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        let completed_at = match to {
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Timeout
            | TaskStatus::Skipped => Some(Utc::now()),
            _ => None,
        };

        let rows = db::transition_task_status(
            pool,
            workflow_id,
            task_id,
            from,
            to,
            None,
            completed_at,
        )
        .await
        .with_context(|| {
            format!("failed to transition task {task_id} from {from} to {to}")
        })?;

        if rows == 0 {
            let current = db::get_task(pool, workflow_id, task_id).await?;
            match current {
                None => bail!("task {} not found in workflow {}", task_id, workflow_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {}, expected {}",
                    task_id,
                    t.status,
                    from
                ),
            }
        }

        Ok(())
    }
}
