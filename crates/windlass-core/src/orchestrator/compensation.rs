//! Saga compensation: user-supplied inverse actions invoked in reverse
//! completion order when a workflow fails, plus the per-task failure and
//! timeout hooks.
//!
//! Compensations run through the same outbox-idempotent path as forward
//! work. A failed compensation emits exactly one `compensation_failed`
//! event and does not abort the remaining compensations.

use serde_json::{Value, json};
use tracing::{info, warn};

use windlass_db::models::TaskStatus;
use windlass_db::queries::tasks as task_db;

use crate::events::{EventRecord, EventType};
use crate::executor::ToolInvocation;
use crate::outbox::{NewOutboxEntry, derive_idempotency_key};
use crate::spec::WorkflowSpec;

use super::Inner;

/// Outcome of one compensation invocation, for logging and tests.
#[derive(Debug, Clone)]
pub struct CompensationReport {
    pub task_id: String,
    pub tool: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Run the compensation for every completed task that declared one, in
/// reverse completion order (ties broken by reverse spec order).
pub(crate) async fn run_compensations(
    inner: &Inner,
    spec: &WorkflowSpec,
) -> anyhow::Result<Vec<CompensationReport>> {
    let tenant = spec.tenant_id.clone();
    let mut completed: Vec<_> = task_db::list_tasks(&inner.pool, &spec.id)
        .await?
        .into_iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();
    // list_tasks returns spec order; reversing first makes the stable sort
    // break completion-time ties in reverse spec order.
    completed.reverse();
    completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

    let mut reports = Vec::new();

    for task_state in &completed {
        let Some(task) = spec.task(&task_state.task_id) else {
            continue;
        };
        let Some(compensation) = &task.compensation_action else {
            continue;
        };

        let report = invoke_compensation(
            inner,
            &spec.id,
            tenant.clone(),
            &task.id,
            &compensation.tool,
            serde_json::to_value(&compensation.args).unwrap_or(Value::Null),
            "saga",
        )
        .await;
        reports.push(report);
    }

    Ok(reports)
}

/// Fire a failure/timeout hook for one task attempt.
///
/// The idempotency key includes the attempt number: each timeout occurrence
/// compensates its own attempt's partial work.
pub(crate) async fn fire_hook(
    inner: &Inner,
    workflow_id: &str,
    tenant: Option<String>,
    task_id: &str,
    hook_tool: &str,
    trigger: &str,
    attempt: u32,
) -> CompensationReport {
    invoke_compensation(
        inner,
        workflow_id,
        tenant,
        task_id,
        hook_tool,
        json!({"trigger": trigger, "attempt": attempt}),
        trigger,
    )
    .await
}

async fn invoke_compensation(
    inner: &Inner,
    workflow_id: &str,
    tenant: Option<String>,
    task_id: &str,
    tool: &str,
    args: Value,
    trigger: &str,
) -> CompensationReport {
    inner
        .emit(EventRecord::task(
            EventType::CompensationTriggered,
            workflow_id,
            task_id,
            tenant.clone(),
            json!({"tool": tool, "trigger": trigger}),
        ))
        .await;

    let key_scope = format!("{task_id}::compensation::{trigger}");
    let key = derive_idempotency_key(workflow_id, &key_scope, &args);
    let new = NewOutboxEntry {
        workflow_id,
        task_id,
        tool_id: tool,
        params: &args,
        idempotency_key: &key,
        max_attempts: 1,
    };

    let invocation = ToolInvocation {
        workflow_id: workflow_id.to_owned(),
        task_id: task_id.to_owned(),
        tool: tool.to_owned(),
        params: args.clone(),
        attempt: 1,
        sandbox: Default::default(),
    };
    let executor = inner.compensation_executor.clone();

    let result = inner
        .outbox
        .execute(&new, || async move {
            executor
                .execute(&invocation, tokio_util::sync::CancellationToken::new())
                .await
        })
        .await;

    match result {
        Ok(_) => {
            info!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                tool = %tool,
                "compensation completed"
            );
            inner
                .emit(EventRecord::task(
                    EventType::CompensationCompleted,
                    workflow_id,
                    task_id,
                    tenant,
                    json!({"tool": tool, "trigger": trigger}),
                ))
                .await;
            CompensationReport {
                task_id: task_id.to_owned(),
                tool: tool.to_owned(),
                succeeded: true,
                error: None,
            }
        }
        Err(e) => {
            // Never masks the original workflow failure; compensation is
            // not retried.
            warn!(
                workflow_id = %workflow_id,
                task_id = %task_id,
                tool = %tool,
                error = %e,
                "compensation failed"
            );
            inner
                .emit(EventRecord::task(
                    EventType::CompensationFailed,
                    workflow_id,
                    task_id,
                    tenant,
                    json!({"tool": tool, "trigger": trigger, "error": e.to_string()}),
                ))
                .await;
            CompensationReport {
                task_id: task_id.to_owned(),
                tool: tool.to_owned(),
                succeeded: false,
                error: Some(e.to_string()),
            }
        }
    }
}
