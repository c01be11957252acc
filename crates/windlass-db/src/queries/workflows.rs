//! Database query functions for the `workflow_state` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{WorkflowState, WorkflowStatus};

/// Insert a workflow row in `pending` status if none exists yet, and return
/// the stored row either way.
///
/// `ON CONFLICT DO NOTHING` makes re-entry (orchestrator restart) a no-op.
pub async fn ensure_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
    tenant_id: Option<&str>,
) -> Result<WorkflowState> {
    sqlx::query(
        "INSERT INTO workflow_state (workflow_id, tenant_id, status, created_at) \
         VALUES ($1, $2, 'pending', $3) \
         ON CONFLICT (workflow_id) DO NOTHING",
    )
    .bind(workflow_id)
    .bind(tenant_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to insert workflow state")?;

    get_workflow(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} missing after insert"))
}

/// Fetch a single workflow by id, without tenant filtering.
pub async fn get_workflow(pool: &SqlitePool, workflow_id: &str) -> Result<Option<WorkflowState>> {
    let row = sqlx::query_as::<_, WorkflowState>(
        "SELECT * FROM workflow_state WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch workflow state")?;

    Ok(row)
}

/// Fetch a workflow scoped to a tenant.
///
/// When `tenant_id` is `Some`, only a row whose stored tenant matches is
/// returned; rows with no tenant or a different tenant are invisible. A
/// `None` tenant is an administrative read with no filter.
pub async fn get_workflow_for_tenant(
    pool: &SqlitePool,
    workflow_id: &str,
    tenant_id: Option<&str>,
) -> Result<Option<WorkflowState>> {
    let row = get_workflow(pool, workflow_id).await?;
    Ok(match tenant_id {
        None => row,
        Some(tenant) => row.filter(|w| w.tenant_id.as_deref() == Some(tenant)),
    })
}

/// Atomically transition a workflow from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did not
/// match).
pub async fn transition_workflow_status(
    pool: &SqlitePool,
    workflow_id: &str,
    from: WorkflowStatus,
    to: WorkflowStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_state \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE workflow_id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(workflow_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow status")?;

    Ok(result.rows_affected())
}

/// Record the terminal error message on a workflow.
pub async fn set_workflow_error(pool: &SqlitePool, workflow_id: &str, error: &str) -> Result<()> {
    let result = sqlx::query("UPDATE workflow_state SET error = $1 WHERE workflow_id = $2")
        .bind(error)
        .bind(workflow_id)
        .execute(pool)
        .await
        .context("failed to set workflow error")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {workflow_id} not found");
    }

    Ok(())
}

/// Reset a failed workflow back to `running` for re-execution, clearing the
/// previous error and completion timestamp.
pub async fn reset_failed_workflow(pool: &SqlitePool, workflow_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_state \
         SET status = 'running', error = NULL, completed_at = NULL \
         WHERE workflow_id = $1 AND status = 'failed'",
    )
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("failed to reset failed workflow")?;

    Ok(result.rows_affected())
}
