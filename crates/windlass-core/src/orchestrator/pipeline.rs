//! The per-task execution pipeline.
//!
//! Each attempt runs: policy gate, feasibility check, lock acquisition
//! (first attempt only), fault injection, world-state snapshot, execution
//! through the outbox under the task deadline, CRV validation, world-state
//! diff, memory write, lock release. Retryable failures re-enter at the
//! fault-injection step after backoff.

use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use windlass_db::models::{TaskState, TaskStatus};
use windlass_db::queries::tasks as task_db;

use crate::adapters::RecoveryStrategy;
use crate::adapters::crv::Commit;
use crate::adapters::fault::FaultDecision;
use crate::error::TaskFailure;
use crate::events::{EventRecord, EventType};
use crate::executor::ToolInvocation;
use crate::feasibility;
use crate::outbox::{NewOutboxEntry, OutboxError, derive_idempotency_key};
use crate::spec::Task;
use crate::state::TaskLifecycle;
use crate::world::WorldSnapshot;

use super::{Inner, backoff, compensation};

/// Everything a spawned task future needs.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub workflow_id: String,
    pub tenant_id: Option<String>,
    pub task: Task,
}

/// Error marker for a deadline-cancelled executor call, so timeouts can be
/// told apart from ordinary tool errors after the outbox records them.
#[derive(Debug, thiserror::Error)]
#[error("executor deadline of {timeout_ms} ms exceeded")]
struct DeadlineExceeded {
    timeout_ms: u64,
}

/// Run one task to a terminal outcome, including retries.
pub(crate) async fn run_task(inner: &Inner, ctx: &TaskContext) -> Result<Value, TaskFailure> {
    let workflow_id = &ctx.workflow_id;
    let task = &ctx.task;

    let mut current = fetch_state(inner, ctx).await?;
    if current.status == TaskStatus::Completed {
        // Durability: completed tasks are never re-executed.
        debug!(workflow_id = %workflow_id, task_id = %task.id, "task already completed, skipping");
        return Ok(current.result.clone().unwrap_or(Value::Null));
    }

    let mut locks_held = false;
    let result = loop {
        let attempt = TaskLifecycle::begin_attempt(&inner.pool, workflow_id, &task.id, &current)
            .await
            .map_err(TaskFailure::Internal)?;

        if attempt == 1 {
            inner
                .emit(EventRecord::task(
                    EventType::TaskStarted,
                    workflow_id,
                    &task.id,
                    ctx.tenant_id.clone(),
                    json!({"attempt": attempt, "tool": task.tool}),
                ))
                .await;
        }

        match run_attempt(inner, ctx, attempt, &mut locks_held).await {
            Ok(value) => {
                task_db::set_task_result(&inner.pool, workflow_id, &task.id, &value)
                    .await
                    .map_err(TaskFailure::Internal)?;
                TaskLifecycle::transition(
                    &inner.pool,
                    workflow_id,
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::Completed,
                )
                .await
                .map_err(TaskFailure::Internal)?;
                inner
                    .emit(EventRecord::task(
                        EventType::TaskCompleted,
                        workflow_id,
                        &task.id,
                        ctx.tenant_id.clone(),
                        json!({"attempt": attempt}),
                    ))
                    .await;
                info!(
                    workflow_id = %workflow_id,
                    task_id = %task.id,
                    attempt = attempt,
                    "task completed"
                );
                write_lifecycle_note(inner, ctx, "completed", attempt).await;
                break Ok(value);
            }
            Err(failure) => {
                let timed_out = matches!(failure, TaskFailure::Timeout { .. });
                task_db::set_task_error(
                    &inner.pool,
                    workflow_id,
                    &task.id,
                    &failure.audit_message(),
                    timed_out,
                )
                .await
                .map_err(TaskFailure::Internal)?;

                if timed_out {
                    TaskLifecycle::transition(
                        &inner.pool,
                        workflow_id,
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Timeout,
                    )
                    .await
                    .map_err(TaskFailure::Internal)?;
                    inner
                        .emit(EventRecord::task(
                            EventType::TaskTimeout,
                            workflow_id,
                            &task.id,
                            ctx.tenant_id.clone(),
                            json!({"attempt": attempt, "timeout_ms": task.timeout_ms}),
                        ))
                        .await;
                    if let Some(hook) = &task.compensation_hooks.on_timeout {
                        compensation::fire_hook(
                            inner,
                            workflow_id,
                            ctx.tenant_id.clone(),
                            &task.id,
                            hook,
                            "timeout",
                            attempt,
                        )
                        .await;
                    }
                } else {
                    TaskLifecycle::transition(
                        &inner.pool,
                        workflow_id,
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                    )
                    .await
                    .map_err(TaskFailure::Internal)?;
                }

                let can_retry = failure.is_retryable() && attempt < task.retry.max_attempts;
                if can_retry {
                    let delay = backoff::retry_delay(&task.retry, attempt);
                    inner
                        .emit(EventRecord::task(
                            EventType::TaskRetry,
                            workflow_id,
                            &task.id,
                            ctx.tenant_id.clone(),
                            json!({
                                "attempt": attempt,
                                "next_attempt": attempt + 1,
                                "delay_ms": delay.as_millis() as u64,
                                "error": failure.audit_message(),
                            }),
                        ))
                        .await;
                    info!(
                        workflow_id = %workflow_id,
                        task_id = %task.id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "task attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    current = fetch_state(inner, ctx).await?;
                    continue;
                }

                if !timed_out {
                    inner
                        .emit(EventRecord::task(
                            EventType::TaskFailed,
                            workflow_id,
                            &task.id,
                            ctx.tenant_id.clone(),
                            json!({"attempt": attempt, "code": failure.code()}),
                        ))
                        .await;
                    if let Some(hook) = &task.compensation_hooks.on_failure {
                        compensation::fire_hook(
                            inner,
                            workflow_id,
                            ctx.tenant_id.clone(),
                            &task.id,
                            hook,
                            "failure",
                            attempt,
                        )
                        .await;
                    }
                }
                warn!(
                    workflow_id = %workflow_id,
                    task_id = %task.id,
                    attempt = attempt,
                    code = failure.code(),
                    "task failed terminally"
                );
                write_lifecycle_note(inner, ctx, failure.code(), attempt).await;
                break Err(failure);
            }
        }
    };

    if locks_held {
        release_locks(inner, ctx).await;
    }

    result
}

async fn fetch_state(inner: &Inner, ctx: &TaskContext) -> Result<TaskState, TaskFailure> {
    task_db::get_task(&inner.pool, &ctx.workflow_id, &ctx.task.id)
        .await
        .map_err(TaskFailure::Internal)?
        .ok_or_else(|| {
            TaskFailure::Internal(anyhow!(
                "task {} missing from workflow {}",
                ctx.task.id,
                ctx.workflow_id
            ))
        })
}

/// One attempt of the pipeline, steps 1-8.
async fn run_attempt(
    inner: &Inner,
    ctx: &TaskContext,
    attempt: u32,
    locks_held: &mut bool,
) -> Result<Value, TaskFailure> {
    let task = &ctx.task;

    // Policy, feasibility, and lock acquisition are per-task, not
    // per-attempt: retries re-enter at the fault-injection step.
    if attempt == 1 {
        check_policy(inner, task).await?;
        check_feasibility(inner, task).await?;
        if !task.locks.is_empty() {
            // Marked before acquiring: a partial acquisition still gets its
            // grants released (releasing a never-granted lock is a no-op).
            *locks_held = true;
            acquire_locks(inner, ctx).await?;
        }
    }

    apply_fault(inner, ctx, attempt).await?;

    let snapshot = take_snapshot(inner, ctx).await?;

    let value = execute_through_outbox(inner, ctx, attempt).await?;
    let value = run_crv(inner, ctx, value).await?;

    record_diff(inner, ctx, snapshot).await?;

    Ok(value)
}

async fn check_policy(inner: &Inner, task: &Task) -> Result<(), TaskFailure> {
    let Some(policy) = &inner.policy else {
        return Ok(());
    };
    let decision = policy
        .check(&inner.principal, task)
        .await
        .map_err(TaskFailure::Internal)?;
    if decision.allowed {
        Ok(())
    } else {
        Err(TaskFailure::PolicyBlocked {
            reason: decision.reason.unwrap_or_else(|| "denied".to_owned()),
        })
    }
}

async fn check_feasibility(inner: &Inner, task: &Task) -> Result<(), TaskFailure> {
    if inner.tools.is_none() && inner.constraints.is_none() {
        return Ok(());
    }
    let world = match &inner.world {
        Some(world) => world
            .dump()
            .await
            .map_err(|e| TaskFailure::Internal(anyhow!(e)))?,
        None => Default::default(),
    };
    let report = feasibility::check(
        task,
        inner.tools.as_deref(),
        inner.constraints.as_deref(),
        &world,
    );
    if report.feasible {
        debug!(
            task_id = %task.id,
            confidence = report.confidence_score,
            "feasibility check passed"
        );
        Ok(())
    } else {
        Err(report.into_failure(task))
    }
}

async fn acquire_locks(inner: &Inner, ctx: &TaskContext) -> Result<(), TaskFailure> {
    let Some(coordinator) = &inner.coordinator else {
        return Ok(());
    };
    // The workflow acts as the agent for its tasks' locks.
    let agent = &ctx.workflow_id;
    for request in &ctx.task.locks {
        let deadline =
            tokio::time::Instant::now() + inner.config.lock_acquire_timeout;
        loop {
            if coordinator
                .acquire_lock(&request.resource_id, agent, &ctx.workflow_id, request.mode)
                .await
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                coordinator.cancel_wait(&request.resource_id, agent).await;
                return Err(TaskFailure::LockTimeout {
                    resource_id: request.resource_id.clone(),
                });
            }
            tokio::time::sleep(inner.config.lock_poll_interval).await;
        }
    }
    Ok(())
}

pub(crate) async fn release_locks(inner: &Inner, ctx: &TaskContext) {
    let Some(coordinator) = &inner.coordinator else {
        return;
    };
    let agent = &ctx.workflow_id;
    for request in &ctx.task.locks {
        coordinator
            .release_lock(&request.resource_id, agent, &ctx.workflow_id)
            .await;
    }
}

async fn apply_fault(inner: &Inner, ctx: &TaskContext, attempt: u32) -> Result<(), TaskFailure> {
    let Some(fault) = &inner.fault else {
        return Ok(());
    };
    match fault
        .inject_before_task(&ctx.workflow_id, &ctx.task.id, ctx.task.tool.as_deref())
        .await
    {
        FaultDecision::Proceed => Ok(()),
        FaultDecision::Delay(delay) => {
            inner
                .emit(EventRecord::task(
                    EventType::FaultInjected,
                    &ctx.workflow_id,
                    &ctx.task.id,
                    ctx.tenant_id.clone(),
                    json!({"kind": "delay", "delay_ms": delay.as_millis() as u64, "attempt": attempt}),
                ))
                .await;
            tokio::time::sleep(delay).await;
            Ok(())
        }
        FaultDecision::Fail(message) => {
            inner
                .emit(EventRecord::task(
                    EventType::FaultInjected,
                    &ctx.workflow_id,
                    &ctx.task.id,
                    ctx.tenant_id.clone(),
                    json!({"kind": "error", "message": message, "attempt": attempt}),
                ))
                .await;
            Err(TaskFailure::FaultInjected(message))
        }
    }
}

async fn take_snapshot(
    inner: &Inner,
    ctx: &TaskContext,
) -> Result<Option<WorldSnapshot>, TaskFailure> {
    let Some(world) = &inner.world else {
        return Ok(None);
    };
    let snapshot = world
        .snapshot()
        .await
        .map_err(|e| TaskFailure::Internal(anyhow!(e)))?;
    inner
        .emit(EventRecord::task(
            EventType::StateSnapshot,
            &ctx.workflow_id,
            &ctx.task.id,
            ctx.tenant_id.clone(),
            json!({"versions": snapshot}),
        ))
        .await;
    Ok(Some(snapshot))
}

async fn execute_through_outbox(
    inner: &Inner,
    ctx: &TaskContext,
    attempt: u32,
) -> Result<Value, TaskFailure> {
    let task = &ctx.task;
    let params = serde_json::to_value(&task.inputs)
        .map_err(|e| TaskFailure::Internal(anyhow!(e)))?;
    let tool_id = task
        .tool
        .clone()
        .unwrap_or_else(|| format!("task:{}", task.task_type));
    let key = task
        .idempotency_key
        .clone()
        .unwrap_or_else(|| derive_idempotency_key(&ctx.workflow_id, &task.id, &params));

    let new = NewOutboxEntry {
        workflow_id: &ctx.workflow_id,
        task_id: &task.id,
        tool_id: &tool_id,
        params: &params,
        idempotency_key: &key,
        max_attempts: task.retry.max_attempts as i64,
    };

    let invocation = ToolInvocation {
        workflow_id: ctx.workflow_id.clone(),
        task_id: task.id.clone(),
        tool: tool_id.clone(),
        params: params.clone(),
        attempt,
        sandbox: task.sandbox,
    };
    let executor = inner.executor.clone();
    let timeout_ms = task.timeout_ms;

    let outcome = inner
        .outbox
        .execute(&new, || async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            let call = executor.execute(&invocation, cancel.clone());
            match timeout_ms {
                None => call.await,
                Some(ms) => {
                    match tokio::time::timeout(Duration::from_millis(ms), call).await {
                        Ok(result) => result,
                        Err(_elapsed) => {
                            // Deadline hit: signal cooperative cancellation
                            // and abandon the call. Whatever it did without
                            // committing will be retried or compensated.
                            cancel.cancel();
                            Err(anyhow::Error::new(DeadlineExceeded { timeout_ms: ms }))
                        }
                    }
                }
            }
        })
        .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(OutboxError::Execution { source, .. }) => {
            match source.downcast_ref::<DeadlineExceeded>() {
                Some(deadline) => Err(TaskFailure::Timeout {
                    timeout_ms: deadline.timeout_ms,
                }),
                None => Err(TaskFailure::ToolError(source)),
            }
        }
        Err(other) => Err(TaskFailure::Internal(anyhow::Error::new(other))),
    }
}

async fn run_crv(inner: &Inner, ctx: &TaskContext, value: Value) -> Result<Value, TaskFailure> {
    let Some(gate) = &inner.crv else {
        return Ok(value);
    };
    let commit = Commit {
        workflow_id: ctx.workflow_id.clone(),
        task_id: ctx.task.id.clone(),
        data: value.clone(),
    };
    let outcome = gate
        .validate(&commit)
        .await
        .map_err(TaskFailure::Internal)?;
    if !outcome.blocked {
        return Ok(value);
    }

    let failure_code = outcome
        .failure_code
        .clone()
        .unwrap_or_else(|| "crv_blocked".to_owned());

    match outcome.recovery_strategy {
        // `ignore` accepts the original (invalid) data as committed.
        Some(RecoveryStrategy::Ignore) => {
            warn!(
                workflow_id = %ctx.workflow_id,
                task_id = %ctx.task.id,
                failure_code = %failure_code,
                "CRV blocked but strategy is ignore, keeping original data"
            );
            Ok(value)
        }
        Some(strategy) => {
            let Some(recovery) = &inner.recovery else {
                return Err(TaskFailure::CrvBlocked { failure_code });
            };
            let args = outcome.recovery_args.clone().unwrap_or(Value::Null);
            let attempt = match strategy {
                RecoveryStrategy::RetryAltTool => recovery.retry_alt_tool(&args, &commit).await,
                RecoveryStrategy::AskUser => recovery.ask_user(&args, &commit).await,
                RecoveryStrategy::Escalate => recovery.escalate(&args, &commit).await,
                RecoveryStrategy::Ignore => unreachable!("handled above"),
            };
            let recovered = attempt.map_err(|e| TaskFailure::RecoveryFailed(e.to_string()))?;
            if recovered.success {
                // Recovered data retroactively becomes the task result.
                Ok(recovered.recovered_data.unwrap_or(value))
            } else {
                Err(TaskFailure::CrvBlocked { failure_code })
            }
        }
        None => Err(TaskFailure::CrvBlocked { failure_code }),
    }
}

async fn record_diff(
    inner: &Inner,
    ctx: &TaskContext,
    snapshot: Option<WorldSnapshot>,
) -> Result<(), TaskFailure> {
    let (Some(world), Some(snapshot)) = (&inner.world, snapshot) else {
        return Ok(());
    };
    let diff = world
        .diff(&snapshot)
        .await
        .map_err(|e| TaskFailure::Internal(anyhow!(e)))?;
    let conflicts = world.take_conflicts().await;
    inner
        .emit(EventRecord::task(
            EventType::StateUpdated,
            &ctx.workflow_id,
            &ctx.task.id,
            ctx.tenant_id.clone(),
            json!({"diff": diff, "conflicts": conflicts}),
        ))
        .await;
    Ok(())
}

async fn write_lifecycle_note(inner: &Inner, ctx: &TaskContext, status: &str, attempt: u32) {
    if let Some(memory) = &inner.memory {
        let note = json!({
            "task_id": ctx.task.id,
            "status": status,
            "attempt": attempt,
        });
        if let Err(e) = memory
            .write_episodic_note(&ctx.workflow_id, Some(&ctx.task.id), "task_lifecycle", &note)
            .await
        {
            warn!(error = %e, "failed to write episodic note (best-effort)");
        }
    }
    if let Some(telemetry) = &inner.telemetry {
        let attrs = json!({
            "workflow_id": ctx.workflow_id,
            "task_id": ctx.task.id,
            "status": status,
            "attempt": attempt,
        });
        if let Err(e) = telemetry.record_event("task_lifecycle", &attrs).await {
            warn!(error = %e, "failed to record telemetry event (best-effort)");
        }
    }
}
