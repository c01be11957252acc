//! The workflow orchestrator: DAG-aware scheduler binding the stores, the
//! outbox, the coordinator, and the collaborator gates into one execution
//! loop.
//!
//! Ready tasks (all prerequisites completed) run concurrently under a
//! semaphore; completion flows back over a channel. State is persisted after
//! every transition, so a restarted orchestrator resumes without
//! re-executing committed side effects.

pub mod backoff;
mod compensation;
mod pipeline;

pub use compensation::CompensationReport;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::sync::{Semaphore, mpsc};
use tracing::{info, warn};

use windlass_db::models::{TaskState, TaskStatus, WorkflowState, WorkflowStatus};
use windlass_db::queries::outbox as outbox_db;
use windlass_db::queries::tasks as task_db;
use windlass_db::queries::workflows as workflow_db;

use crate::adapters::{
    ConstraintEngine, CrvGate, FaultInjector, MemoryApi, PolicyGuard, RecoveryExecutor,
    TelemetryCollector, ToolRegistry,
};
use crate::coordinator::Coordinator;
use crate::error::{TaskFailure, WorkflowError};
use crate::events::{EventLog, EventRecord, EventType, FileEventLog};
use crate::executor::TaskExecutor;
use crate::outbox::OutboxService;
use crate::spec::{WorkflowSpec, validate};
use crate::state::TaskLifecycle;
use crate::world::WorldStateStore;

use pipeline::TaskContext;

/// Tuning knobs for the orchestration loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cap on concurrently executing tasks. `None` means one permit per
    /// task in the spec.
    pub concurrency: Option<usize>,
    /// How long a task polls for its declared locks before failing with
    /// `LOCK_TIMEOUT`.
    pub lock_acquire_timeout: Duration,
    /// Spacing between lock polls.
    pub lock_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            lock_acquire_timeout: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(10),
        }
    }
}

/// A workflow's durable state plus its per-task states.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowView {
    pub state: WorkflowState,
    pub tasks: Vec<TaskState>,
}

impl WorkflowView {
    /// Look up one task's state.
    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Shared internals, one `Arc` per orchestrator.
pub(crate) struct Inner {
    pub(crate) pool: SqlitePool,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) compensation_executor: Arc<dyn TaskExecutor>,
    pub(crate) event_log: Arc<dyn EventLog>,
    pub(crate) outbox: OutboxService,
    pub(crate) world: Option<Arc<WorldStateStore>>,
    pub(crate) policy: Option<Arc<dyn PolicyGuard>>,
    pub(crate) principal: String,
    pub(crate) tools: Option<Arc<dyn ToolRegistry>>,
    pub(crate) constraints: Option<Arc<dyn ConstraintEngine>>,
    pub(crate) crv: Option<Arc<dyn CrvGate>>,
    pub(crate) recovery: Option<Arc<dyn RecoveryExecutor>>,
    pub(crate) fault: Option<Arc<dyn FaultInjector>>,
    pub(crate) coordinator: Option<Arc<Coordinator>>,
    pub(crate) memory: Option<Arc<dyn MemoryApi>>,
    pub(crate) telemetry: Option<Arc<dyn TelemetryCollector>>,
    pub(crate) config: OrchestratorConfig,
}

impl Inner {
    /// Append to the event log, best-effort.
    pub(crate) async fn emit(&self, record: EventRecord) {
        if let Err(e) = self.event_log.append(record).await {
            warn!(error = %e, "failed to append event (best-effort)");
        }
    }
}

/// Message sent from spawned task futures back to the scheduling loop.
struct TaskDone {
    task_id: String,
    result: Result<(), TaskFailure>,
}

/// Builder for [`Orchestrator`]. `pool` and `executor` are required; every
/// other collaborator defaults to disabled, which skips its pipeline step.
#[derive(Default)]
pub struct OrchestratorBuilder {
    pool: Option<SqlitePool>,
    executor: Option<Arc<dyn TaskExecutor>>,
    compensation_executor: Option<Arc<dyn TaskExecutor>>,
    event_log: Option<Arc<dyn EventLog>>,
    world: Option<Arc<WorldStateStore>>,
    policy: Option<Arc<dyn PolicyGuard>>,
    principal: Option<String>,
    tools: Option<Arc<dyn ToolRegistry>>,
    constraints: Option<Arc<dyn ConstraintEngine>>,
    crv: Option<Arc<dyn CrvGate>>,
    recovery: Option<Arc<dyn RecoveryExecutor>>,
    fault: Option<Arc<dyn FaultInjector>>,
    coordinator: Option<Arc<Coordinator>>,
    memory: Option<Arc<dyn MemoryApi>>,
    telemetry: Option<Arc<dyn TelemetryCollector>>,
    outbox_stuck_threshold: Option<Duration>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Executor for compensations; defaults to the main executor.
    pub fn compensation_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.compensation_executor = Some(executor);
        self
    }

    /// Event log; defaults to a file journal under `./var/run`.
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn world_state(mut self, world: Arc<WorldStateStore>) -> Self {
        self.world = Some(world);
        self
    }

    pub fn policy_guard(mut self, guard: Arc<dyn PolicyGuard>) -> Self {
        self.policy = Some(guard);
        self
    }

    /// Principal presented to the policy gate; defaults to `orchestrator`.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn tool_registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(registry);
        self
    }

    pub fn constraint_engine(mut self, engine: Arc<dyn ConstraintEngine>) -> Self {
        self.constraints = Some(engine);
        self
    }

    pub fn crv_gate(mut self, gate: Arc<dyn CrvGate>) -> Self {
        self.crv = Some(gate);
        self
    }

    pub fn recovery_executor(mut self, recovery: Arc<dyn RecoveryExecutor>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn fault_injector(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.fault = Some(injector);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn memory_api(mut self, memory: Arc<dyn MemoryApi>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryCollector>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = Some(limit);
        self
    }

    pub fn lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_acquire_timeout = timeout;
        self
    }

    pub fn outbox_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.outbox_stuck_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let pool = self.pool.context("orchestrator requires a database pool")?;
        let executor = self.executor.context("orchestrator requires an executor")?;

        let mut outbox = OutboxService::new(pool.clone());
        if let Some(threshold) = self.outbox_stuck_threshold {
            outbox = outbox.with_stuck_threshold(threshold);
        }

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                pool,
                compensation_executor: self
                    .compensation_executor
                    .unwrap_or_else(|| executor.clone()),
                executor,
                event_log: self
                    .event_log
                    .unwrap_or_else(|| Arc::new(FileEventLog::default_root())),
                outbox,
                world: self.world,
                policy: self.policy,
                principal: self.principal.unwrap_or_else(|| "orchestrator".to_owned()),
                tools: self.tools,
                constraints: self.constraints,
                crv: self.crv,
                recovery: self.recovery,
                fault: self.fault,
                coordinator: self.coordinator,
                memory: self.memory,
                telemetry: self.telemetry,
                config: self.config,
            }),
        })
    }
}

/// The orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Access the outbox service (reconciliation, cleanup).
    pub fn outbox(&self) -> &OutboxService {
        &self.inner.outbox
    }

    /// Execute a workflow to completion.
    ///
    /// Re-executing a completed workflow is a no-op returning the stored
    /// state. A partially-completed or failed workflow resumes: completed
    /// tasks are skipped, and committed outbox entries are never re-issued.
    pub async fn execute(&self, spec: &WorkflowSpec) -> Result<WorkflowView, WorkflowError> {
        validate::validate(spec)?;
        let inner = &self.inner;
        let tenant = spec.tenant_id.clone();

        let workflow = workflow_db::ensure_workflow(&inner.pool, &spec.id, tenant.as_deref())
            .await
            .map_err(WorkflowError::storage)?;

        match workflow.status {
            WorkflowStatus::Completed => {
                info!(workflow_id = %spec.id, "workflow already completed, returning stored state");
                return self.view(&spec.id).await;
            }
            WorkflowStatus::Failed => {
                // Re-execution of a failed workflow: completed tasks stay
                // completed, everything else gets a fresh attempt budget.
                // Failed and dead-lettered outbox entries are revived with
                // it; committed entries keep their replay protection.
                workflow_db::reset_failed_workflow(&inner.pool, &spec.id)
                    .await
                    .map_err(WorkflowError::storage)?;
                let reset = task_db::reset_tasks_for_rerun(&inner.pool, &spec.id)
                    .await
                    .map_err(WorkflowError::storage)?;
                let revived = outbox_db::revive_for_workflow(&inner.pool, &spec.id)
                    .await
                    .map_err(WorkflowError::storage)?;
                info!(
                    workflow_id = %spec.id,
                    reset = reset,
                    revived = revived,
                    "re-executing failed workflow"
                );
            }
            WorkflowStatus::Pending => {
                workflow_db::transition_workflow_status(
                    &inner.pool,
                    &spec.id,
                    WorkflowStatus::Pending,
                    WorkflowStatus::Running,
                    Some(Utc::now()),
                    None,
                )
                .await
                .map_err(WorkflowError::storage)?;
                inner
                    .emit(EventRecord::workflow(
                        EventType::WorkflowStarted,
                        &spec.id,
                        tenant.clone(),
                        json!({"name": spec.name, "tasks": spec.tasks.len()}),
                    ))
                    .await;
            }
            WorkflowStatus::Running => {
                // Restart recovery: tasks left in `running` by a crash are
                // reset to `failed`, then rescheduled when they still have
                // attempts left.
                let orphaned = task_db::reset_orphaned_tasks(&inner.pool, &spec.id)
                    .await
                    .map_err(WorkflowError::storage)?;
                for orphan in &orphaned {
                    warn!(
                        workflow_id = %spec.id,
                        task_id = %orphan.task_id,
                        attempt = orphan.attempt,
                        "reset orphaned task"
                    );
                    let budget = spec
                        .task(&orphan.task_id)
                        .map(|t| t.retry.max_attempts)
                        .unwrap_or(1);
                    if (orphan.attempt as u32) < budget {
                        task_db::reset_task_to_pending(
                            &inner.pool,
                            &spec.id,
                            &orphan.task_id,
                            orphan.attempt,
                        )
                        .await
                        .map_err(WorkflowError::storage)?;
                    }
                }
                info!(workflow_id = %spec.id, "resuming workflow");
            }
        }

        for task in &spec.tasks {
            task_db::ensure_task(&inner.pool, &spec.id, &task.id)
                .await
                .map_err(WorkflowError::storage)?;
        }

        self.run_loop(spec).await
    }

    /// The scheduling loop: spawn ready tasks, collect outcomes, terminate
    /// on completion or first terminal failure.
    async fn run_loop(&self, spec: &WorkflowSpec) -> Result<WorkflowView, WorkflowError> {
        let inner = &self.inner;
        let permits = inner.config.concurrency.unwrap_or(spec.tasks.len().max(1));
        let semaphore = Arc::new(Semaphore::new(permits));
        let (tx, mut rx) = mpsc::channel::<TaskDone>(spec.tasks.len().max(1) * 2);

        let mut in_flight: usize = 0;
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut first_failure: Option<(String, TaskFailure)> = None;

        loop {
            // Drain completed results (non-blocking).
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                scheduled.remove(&done.task_id);
                record_outcome(&mut first_failure, done);
            }

            // Externally-mitigated abort (coordinator ABORT strategy).
            if first_failure.is_none() {
                if let Some(coordinator) = &inner.coordinator {
                    if coordinator.is_workflow_aborted(&spec.id).await {
                        let victim = spec
                            .tasks
                            .iter()
                            .map(|t| t.id.clone())
                            .next()
                            .unwrap_or_default();
                        first_failure = Some((
                            victim,
                            TaskFailure::Deadlock {
                                cycle: vec![spec.id.clone()],
                            },
                        ));
                    }
                }
            }

            // First terminal failure: drain in-flight siblings, then fail.
            if let Some((task_id, failure)) = first_failure.take() {
                while in_flight > 0 {
                    match rx.recv().await {
                        Some(done) => {
                            in_flight -= 1;
                            scheduled.remove(&done.task_id);
                            if let Err(e) = &done.result {
                                warn!(
                                    task_id = %done.task_id,
                                    code = e.code(),
                                    "sibling task also failed during drain"
                                );
                            }
                        }
                        None => break,
                    }
                }
                return self.fail_workflow(spec, task_id, failure).await;
            }

            let states = task_db::list_tasks(&inner.pool, &spec.id)
                .await
                .map_err(WorkflowError::storage)?;
            let by_id: HashMap<&str, &TaskState> =
                states.iter().map(|t| (t.task_id.as_str(), t)).collect();

            // Terminal leftovers from a crash: a failed/timed-out task that
            // no live future owns and that restart recovery did not
            // reschedule has no attempts left.
            if let Some(stuck) = states.iter().find(|t| {
                matches!(t.status, TaskStatus::Failed | TaskStatus::Timeout)
                    && !scheduled.contains(&t.task_id)
            }) {
                let error = stuck
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed with no attempts remaining".to_owned());
                return self
                    .fail_workflow(
                        spec,
                        stuck.task_id.clone(),
                        TaskFailure::ToolError(anyhow!("{error}")),
                    )
                    .await;
            }

            // Termination: every task completed.
            if states.iter().all(|t| t.status == TaskStatus::Completed) {
                workflow_db::transition_workflow_status(
                    &inner.pool,
                    &spec.id,
                    WorkflowStatus::Running,
                    WorkflowStatus::Completed,
                    None,
                    Some(Utc::now()),
                )
                .await
                .map_err(WorkflowError::storage)?;
                inner
                    .emit(EventRecord::workflow(
                        EventType::WorkflowCompleted,
                        &spec.id,
                        spec.tenant_id.clone(),
                        Value::Null,
                    ))
                    .await;
                info!(workflow_id = %spec.id, "workflow completed");

                let view = self.view(&spec.id).await?;
                if let Some(telemetry) = &inner.telemetry {
                    let duration_ms = match (view.state.started_at, view.state.completed_at) {
                        (Some(start), Some(end)) => {
                            end.signed_duration_since(start).num_milliseconds() as f64
                        }
                        _ => 0.0,
                    };
                    if let Err(e) = telemetry
                        .record_metric(
                            "workflow.duration_ms",
                            duration_ms,
                            &json!({"workflow_id": spec.id}),
                        )
                        .await
                    {
                        warn!(error = %e, "failed to record telemetry metric (best-effort)");
                    }
                }
                return Ok(view);
            }

            // Ready set: pending, unscheduled, all prerequisites completed.
            // Iterating spec order keeps the tie-break deterministic.
            let ready: Vec<&crate::spec::Task> = spec
                .tasks
                .iter()
                .filter(|task| {
                    by_id
                        .get(task.id.as_str())
                        .is_some_and(|s| s.status == TaskStatus::Pending)
                        && !scheduled.contains(&task.id)
                        && spec.prerequisites(&task.id).iter().all(|dep| {
                            by_id
                                .get(dep.as_str())
                                .is_some_and(|s| s.status == TaskStatus::Completed)
                        })
                })
                .collect();

            let spawned_any = !ready.is_empty();
            for task in ready {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| WorkflowError::storage(anyhow!(e)))?;

                scheduled.insert(task.id.clone());
                in_flight += 1;

                let ctx = TaskContext {
                    workflow_id: spec.id.clone(),
                    tenant_id: spec.tenant_id.clone(),
                    task: task.clone(),
                };
                let inner_clone = Arc::clone(inner);
                let tx_clone = tx.clone();

                tokio::spawn(async move {
                    let result = pipeline::run_task(&inner_clone, &ctx).await.map(|_| ());
                    drop(permit);
                    let _ = tx_clone
                        .send(TaskDone {
                            task_id: ctx.task.id.clone(),
                            result,
                        })
                        .await;
                });
            }

            if in_flight > 0 {
                // Block for the next completion.
                if let Some(done) = rx.recv().await {
                    in_flight -= 1;
                    scheduled.remove(&done.task_id);
                    record_outcome(&mut first_failure, done);
                }
            } else if !spawned_any {
                // Nothing running, nothing ready, not complete: a
                // prerequisite can never be satisfied.
                let blocked = states
                    .iter()
                    .find(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.task_id.clone())
                    .unwrap_or_default();
                let dependency = spec
                    .prerequisites(&blocked)
                    .iter()
                    .find(|dep| {
                        by_id
                            .get(dep.as_str())
                            .is_none_or(|s| s.status != TaskStatus::Completed)
                    })
                    .cloned()
                    .unwrap_or_default();
                return self
                    .fail_workflow(spec, blocked, TaskFailure::DependencyUnmet { dependency })
                    .await;
            }
        }
    }

    /// Terminal failure path: saga compensation, skip never-started tasks,
    /// persist the failure, emit `workflow_failed`, surface the error.
    async fn fail_workflow(
        &self,
        spec: &WorkflowSpec,
        task_id: String,
        failure: TaskFailure,
    ) -> Result<WorkflowView, WorkflowError> {
        let inner = &self.inner;

        let reports = compensation::run_compensations(inner, spec)
            .await
            .map_err(WorkflowError::storage)?;
        let failed_compensations = reports.iter().filter(|r| !r.succeeded).count();
        if failed_compensations > 0 {
            warn!(
                workflow_id = %spec.id,
                failed = failed_compensations,
                "some compensations failed"
            );
        }

        // Pending tasks never ran; mark them skipped.
        let states = task_db::list_tasks(&inner.pool, &spec.id)
            .await
            .map_err(WorkflowError::storage)?;
        for state in &states {
            if state.status == TaskStatus::Pending {
                if let Err(e) = TaskLifecycle::transition(
                    &inner.pool,
                    &spec.id,
                    &state.task_id,
                    TaskStatus::Pending,
                    TaskStatus::Skipped,
                )
                .await
                {
                    warn!(task_id = %state.task_id, error = %e, "failed to skip task");
                }
            }
        }

        let error = failure.audit_message();
        workflow_db::transition_workflow_status(
            &inner.pool,
            &spec.id,
            WorkflowStatus::Running,
            WorkflowStatus::Failed,
            None,
            Some(Utc::now()),
        )
        .await
        .map_err(WorkflowError::storage)?;
        workflow_db::set_workflow_error(&inner.pool, &spec.id, &error)
            .await
            .map_err(WorkflowError::storage)?;

        inner
            .emit(EventRecord::workflow(
                EventType::WorkflowFailed,
                &spec.id,
                spec.tenant_id.clone(),
                json!({"task_id": task_id, "code": failure.code(), "error": error}),
            ))
            .await;
        warn!(
            workflow_id = %spec.id,
            task_id = %task_id,
            code = failure.code(),
            "workflow failed"
        );

        Err(WorkflowError::TaskFailed {
            workflow_id: spec.id.clone(),
            task_id,
            failure,
        })
    }

    async fn view(&self, workflow_id: &str) -> Result<WorkflowView, WorkflowError> {
        let state = workflow_db::get_workflow(&self.inner.pool, workflow_id)
            .await
            .map_err(WorkflowError::storage)?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_owned()))?;
        let tasks = task_db::list_tasks(&self.inner.pool, workflow_id)
            .await
            .map_err(WorkflowError::storage)?;
        Ok(WorkflowView { state, tasks })
    }

    /// Fetch a workflow's durable state, optionally scoped to a tenant.
    ///
    /// Returns `None` when the workflow does not exist or belongs to a
    /// different tenant.
    pub async fn get_state(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<WorkflowView>, WorkflowError> {
        let Some(state) =
            workflow_db::get_workflow_for_tenant(&self.inner.pool, workflow_id, tenant_id)
                .await
                .map_err(WorkflowError::storage)?
        else {
            return Ok(None);
        };
        let tasks = task_db::list_tasks(&self.inner.pool, workflow_id)
            .await
            .map_err(WorkflowError::storage)?;
        Ok(Some(WorkflowView { state, tasks }))
    }

    /// Read a workflow's event stream, optionally scoped to a tenant.
    pub async fn get_events(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventRecord>, WorkflowError> {
        self.inner
            .event_log
            .read(workflow_id, tenant_id)
            .await
            .map_err(WorkflowError::storage)
    }

    /// Write an episodic note through the configured memory API.
    pub async fn write_episodic_note(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
        tag: &str,
        content: &Value,
    ) -> Result<(), WorkflowError> {
        let memory = self.require_memory()?;
        memory
            .write_episodic_note(workflow_id, task_id, tag, content)
            .await
            .map_err(WorkflowError::storage)
    }

    /// Write an artifact through the configured memory API.
    pub async fn write_artifact(
        &self,
        workflow_id: &str,
        name: &str,
        content: &Value,
    ) -> Result<(), WorkflowError> {
        let memory = self.require_memory()?;
        memory
            .write_artifact(workflow_id, name, content)
            .await
            .map_err(WorkflowError::storage)
    }

    /// Write a snapshot through the configured memory API.
    pub async fn write_snapshot(
        &self,
        workflow_id: &str,
        content: &Value,
    ) -> Result<(), WorkflowError> {
        let memory = self.require_memory()?;
        memory
            .write_snapshot(workflow_id, content)
            .await
            .map_err(WorkflowError::storage)
    }

    fn require_memory(&self) -> Result<&Arc<dyn MemoryApi>, WorkflowError> {
        self.inner
            .memory
            .as_ref()
            .ok_or_else(|| WorkflowError::storage(anyhow!("no memory API configured")))
    }
}

fn record_outcome(first_failure: &mut Option<(String, TaskFailure)>, done: TaskDone) {
    if let Err(failure) = done.result {
        if first_failure.is_none() {
            *first_failure = Some((done.task_id, failure));
        } else {
            warn!(
                task_id = %done.task_id,
                code = failure.code(),
                "additional task failure after the first"
            );
        }
    }
}
