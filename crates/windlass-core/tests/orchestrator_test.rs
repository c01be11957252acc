//! Tests for the orchestrator: dependency ordering, retries, idempotent
//! re-execution, and the policy/feasibility gates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use windlass_core::adapters::{PolicyDecision, PolicyGuard, StaticToolRegistry, ToolInfo};
use windlass_core::error::{TaskFailure, WorkflowError};
use windlass_core::events::{EventLog, EventRecord, EventType, MemoryEventLog};
use windlass_core::executor::{TaskExecutor, ToolInvocation};
use windlass_core::orchestrator::Orchestrator;
use windlass_core::spec::{RetryPolicy, RiskTier, Task, WorkflowSpec};
use windlass_db::models::{TaskStatus, WorkflowStatus};
use windlass_test_utils::create_test_db;

// ===========================================================================
// Scripted executor
// ===========================================================================

/// Executor driven by per-task scripts: fail the first N attempts, sleep,
/// and record invocation order and counts.
#[derive(Default)]
struct ScriptedExecutor {
    fail_first: HashMap<String, u32>,
    sleep_ms: HashMap<String, u64>,
    calls: Mutex<Vec<String>>,
    counts: Mutex<HashMap<String, u32>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn failing_first(mut self, task_id: &str, attempts: u32) -> Self {
        self.fail_first.insert(task_id.to_owned(), attempts);
        self
    }

    fn sleeping(mut self, task_id: &str, ms: u64) -> Self {
        self.sleep_ms.insert(task_id.to_owned(), ms);
        self
    }

    async fn count(&self, task_id: &str) -> u32 {
        self.counts.lock().await.get(task_id).copied().unwrap_or(0)
    }

    async fn order(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Value> {
        self.calls.lock().await.push(invocation.task_id.clone());
        let seen = {
            let mut counts = self.counts.lock().await;
            let count = counts.entry(invocation.task_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(ms) = self.sleep_ms.get(&invocation.task_id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if let Some(fail_first) = self.fail_first.get(&invocation.task_id) {
            if seen <= *fail_first {
                anyhow::bail!("scripted failure {seen} for {}", invocation.task_id);
            }
        }
        Ok(json!({"result": "ok"}))
    }
}

// ===========================================================================
// Fixture
// ===========================================================================

struct Rig {
    orchestrator: Orchestrator,
    events: Arc<MemoryEventLog>,
    executor: Arc<ScriptedExecutor>,
    _dir: tempfile::TempDir,
}

async fn rig(executor: ScriptedExecutor) -> Rig {
    windlass_test_utils::init_tracing();
    let (pool, dir) = create_test_db().await;
    let events = Arc::new(MemoryEventLog::new());
    let executor = Arc::new(executor);
    let orchestrator = Orchestrator::builder()
        .pool(pool)
        .executor(executor.clone())
        .event_log(events.clone())
        .build()
        .expect("build orchestrator");
    Rig {
        orchestrator,
        events,
        executor,
        _dir: dir,
    }
}

fn of_type<'a>(events: &'a [EventRecord], event_type: EventType) -> Vec<&'a EventRecord> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

fn position(events: &[EventRecord], event_type: EventType, task_id: &str) -> usize {
    events
        .iter()
        .position(|e| e.event_type == event_type && e.task_id.as_deref() == Some(task_id))
        .unwrap_or_else(|| panic!("no {event_type} event for {task_id}"))
}

fn chain_spec(workflow_id: &str) -> WorkflowSpec {
    WorkflowSpec::new(workflow_id, "chain")
        .with_task(Task::new("a", "Task A").with_tool("tool_a"))
        .with_task(Task::new("b", "Task B").with_tool("tool_b"))
        .with_task(Task::new("c", "Task C").with_tool("tool_c"))
        .with_dependency("b", "a")
        .with_dependency("c", "b")
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn chain_executes_in_dependency_order() {
    let rig = rig(ScriptedExecutor::new()).await;
    let spec = chain_spec("wf-chain");

    let view = rig.orchestrator.execute(&spec).await.unwrap();

    assert_eq!(view.state.status, WorkflowStatus::Completed);
    for task in ["a", "b", "c"] {
        assert_eq!(view.task(task).unwrap().status, TaskStatus::Completed);
    }
    assert_eq!(rig.executor.order().await, ["a", "b", "c"]);

    let events = rig.events.read("wf-chain", None).await.unwrap();
    assert_eq!(events[0].event_type, EventType::WorkflowStarted);
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::WorkflowCompleted
    );
    for task in ["a", "b", "c"] {
        assert!(
            position(&events, EventType::TaskStarted, task)
                < position(&events, EventType::TaskCompleted, task)
        );
    }
    assert!(of_type(&events, EventType::TaskRetry).is_empty());

    // Timestamps are non-decreasing in append order.
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn diamond_schedules_join_after_both_branches() {
    let rig = rig(ScriptedExecutor::new()).await;
    let spec = WorkflowSpec::new("wf-diamond", "diamond")
        .with_task(Task::new("a", "A"))
        .with_task(Task::new("b", "B"))
        .with_task(Task::new("c", "C"))
        .with_task(Task::new("d", "D"))
        .with_dependency("b", "a")
        .with_dependency("c", "a")
        .with_dependency("d", "b")
        .with_dependency("d", "c");

    let view = rig.orchestrator.execute(&spec).await.unwrap();
    assert_eq!(view.state.status, WorkflowStatus::Completed);

    let events = rig.events.read("wf-diamond", None).await.unwrap();
    let a_done = position(&events, EventType::TaskCompleted, "a");
    let d_start = position(&events, EventType::TaskStarted, "d");
    for branch in ["b", "c"] {
        let start = position(&events, EventType::TaskStarted, branch);
        let done = position(&events, EventType::TaskCompleted, branch);
        assert!(a_done < start, "{branch} started before a completed");
        assert!(done < d_start, "d started before {branch} completed");
    }

    // Dependency ordering also holds on the durable timestamps.
    let d = view.task("d").unwrap();
    for branch in ["b", "c"] {
        let b = view.task(branch).unwrap();
        assert!(b.completed_at.unwrap() <= d.started_at.unwrap());
    }
}

#[tokio::test]
async fn retry_succeeds_on_third_attempt() {
    let rig = rig(ScriptedExecutor::new().failing_first("t1", 2)).await;
    let spec = WorkflowSpec::new("wf-retry", "retry").with_task(
        Task::new("t1", "flaky").with_tool("flaky").with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 10,
            backoff_multiplier: 2.0,
            jitter: false,
        }),
    );

    let started = Instant::now();
    let view = rig.orchestrator.execute(&spec).await.unwrap();
    let elapsed = started.elapsed();

    let t1 = view.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Completed);
    assert_eq!(t1.attempt, 3);
    assert_eq!(rig.executor.count("t1").await, 3);
    // Backoff: 10ms after attempt 1, 20ms after attempt 2.
    assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");

    let events = rig.events.read("wf-retry", None).await.unwrap();
    let retries = of_type(&events, EventType::TaskRetry);
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].metadata["attempt"], json!(1));
    assert_eq!(retries[1].metadata["attempt"], json!(2));
}

#[tokio::test]
async fn retries_exhausted_fails_the_workflow() {
    let rig = rig(ScriptedExecutor::new().failing_first("t1", 10)).await;
    let spec = WorkflowSpec::new("wf-exhaust", "exhaust").with_task(
        Task::new("t1", "doomed").with_retry(RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
            backoff_multiplier: 2.0,
            jitter: false,
        }),
    );

    let err = rig.orchestrator.execute(&spec).await.unwrap_err();
    match &err {
        WorkflowError::TaskFailed {
            task_id, failure, ..
        } => {
            assert_eq!(task_id, "t1");
            assert!(matches!(failure, TaskFailure::ToolError(_)));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    assert_eq!(rig.executor.count("t1").await, 2);

    let view = rig.orchestrator.get_state("wf-exhaust", None).await.unwrap().unwrap();
    assert_eq!(view.state.status, WorkflowStatus::Failed);
    let t1 = view.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.attempt, 2);
    assert!(t1.error.as_deref().unwrap().starts_with("TOOL_ERROR"));

    let events = rig.events.read("wf-exhaust", None).await.unwrap();
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::WorkflowFailed
    );
    assert_eq!(of_type(&events, EventType::TaskFailed).len(), 1);
}

#[tokio::test]
async fn reexecuting_a_completed_workflow_is_a_noop() {
    let rig = rig(ScriptedExecutor::new()).await;
    let spec = chain_spec("wf-idem");

    let first = rig.orchestrator.execute(&spec).await.unwrap();
    assert_eq!(rig.executor.count("a").await, 1);

    let second = rig.orchestrator.execute(&spec).await.unwrap();
    assert_eq!(second.state.status, WorkflowStatus::Completed);
    // The executor ran zero additional times.
    for task in ["a", "b", "c"] {
        assert_eq!(rig.executor.count(task).await, 1, "task {task}");
    }
    assert_eq!(
        first.state.completed_at, second.state.completed_at,
        "stored state must be returned unchanged"
    );
}

#[tokio::test]
async fn rerun_after_failure_resumes_without_recommitting() {
    let rig = rig(ScriptedExecutor::new().failing_first("b", 1)).await;
    let spec = WorkflowSpec::new("wf-resume", "resume")
        .with_task(Task::new("a", "A").with_tool("tool_a"))
        .with_task(Task::new("b", "B").with_tool("tool_b"))
        .with_dependency("b", "a");

    // First run: a commits, b fails terminally.
    let err = rig.orchestrator.execute(&spec).await.unwrap_err();
    assert!(matches!(err, WorkflowError::TaskFailed { .. }));
    assert_eq!(rig.executor.count("a").await, 1);
    assert_eq!(rig.executor.count("b").await, 1);

    // Second run: a is already committed and is skipped; b retries fresh
    // (the scripted failure only hits the first call) and succeeds.
    let view = rig.orchestrator.execute(&spec).await.unwrap();
    assert_eq!(view.state.status, WorkflowStatus::Completed);
    assert_eq!(rig.executor.count("a").await, 1, "a must not re-execute");
    assert_eq!(rig.executor.count("b").await, 2);
}

#[tokio::test]
async fn parallel_siblings_both_commit() {
    let rig = rig(ScriptedExecutor::new().sleeping("a", 20).sleeping("b", 20)).await;
    let spec = WorkflowSpec::new("wf-par", "parallel")
        .with_task(Task::new("a", "A").with_tool("tool_a"))
        .with_task(Task::new("b", "B").with_tool("tool_b"));

    let view = rig.orchestrator.execute(&spec).await.unwrap();
    assert_eq!(view.state.status, WorkflowStatus::Completed);
    assert_eq!(rig.executor.count("a").await, 1);
    assert_eq!(rig.executor.count("b").await, 1);
}

#[tokio::test]
async fn policy_denial_blocks_the_task() {
    struct DenyAll;

    #[async_trait]
    impl PolicyGuard for DenyAll {
        async fn check(&self, _principal: &str, task: &Task) -> anyhow::Result<PolicyDecision> {
            Ok(PolicyDecision::deny(format!("{} is not permitted", task.id)))
        }
    }

    windlass_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let events = Arc::new(MemoryEventLog::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Orchestrator::builder()
        .pool(pool)
        .executor(executor.clone())
        .event_log(events.clone())
        .policy_guard(Arc::new(DenyAll))
        .principal("ci-bot")
        .build()
        .unwrap();

    let spec = WorkflowSpec::new("wf-policy", "policy").with_task(Task::new("t1", "blocked"));
    let err = orchestrator.execute(&spec).await.unwrap_err();
    match err {
        WorkflowError::TaskFailed { failure, .. } => {
            assert!(matches!(failure, TaskFailure::PolicyBlocked { .. }));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    // The executor must never have been consulted.
    assert_eq!(executor.count("t1").await, 0);

    let view = orchestrator.get_state("wf-policy", None).await.unwrap().unwrap();
    let t1 = view.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert!(t1.error.as_deref().unwrap().starts_with("POLICY_BLOCKED"));
}

#[tokio::test]
async fn feasibility_rejects_unavailable_and_risky_tools() {
    windlass_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let executor = Arc::new(ScriptedExecutor::new());
    let registry = StaticToolRegistry::new().with_tool(ToolInfo {
        name: "reactor_control".into(),
        capabilities: vec![],
        available: true,
        risk_level: RiskTier::Critical,
    });
    let orchestrator = Orchestrator::builder()
        .pool(pool)
        .executor(executor.clone())
        .event_log(Arc::new(MemoryEventLog::new()))
        .tool_registry(Arc::new(registry))
        .build()
        .unwrap();

    // Unregistered tool.
    let spec = WorkflowSpec::new("wf-feas-1", "feas")
        .with_task(Task::new("t1", "missing tool").with_tool("no_such_tool"));
    let err = orchestrator.execute(&spec).await.unwrap_err();
    match err {
        WorkflowError::TaskFailed { failure, .. } => {
            assert!(matches!(failure, TaskFailure::ToolUnavailable { .. }));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    // Registered tool above the task's risk tier.
    let spec = WorkflowSpec::new("wf-feas-2", "feas").with_task(
        Task::new("t1", "too risky")
            .with_tool("reactor_control")
            .with_risk_tier(RiskTier::Low),
    );
    let err = orchestrator.execute(&spec).await.unwrap_err();
    match err {
        WorkflowError::TaskFailed { failure, .. } => {
            assert!(matches!(failure, TaskFailure::RiskExceedsTier { .. }));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    assert_eq!(executor.count("t1").await, 0);
}

#[tokio::test]
async fn tenant_isolation_on_reads() {
    let rig = rig(ScriptedExecutor::new()).await;
    let spec = WorkflowSpec::new("wf-tenant", "tenanted")
        .with_tenant("acme")
        .with_task(Task::new("t1", "T1"));

    rig.orchestrator.execute(&spec).await.unwrap();

    assert!(
        rig.orchestrator
            .get_state("wf-tenant", Some("acme"))
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        rig.orchestrator
            .get_state("wf-tenant", Some("globex"))
            .await
            .unwrap()
            .is_none()
    );

    let scoped = rig.orchestrator.get_events("wf-tenant", Some("acme")).await.unwrap();
    assert!(!scoped.is_empty());
    let foreign = rig.orchestrator.get_events("wf-tenant", Some("globex")).await.unwrap();
    assert!(foreign.is_empty());
}

#[tokio::test]
async fn restart_recovery_reschedules_orphaned_tasks() {
    windlass_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let events = Arc::new(MemoryEventLog::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Orchestrator::builder()
        .pool(pool.clone())
        .executor(executor.clone())
        .event_log(events.clone())
        .build()
        .unwrap();

    // Simulate a crash mid-execution: workflow running, task stuck in
    // `running` with one attempt consumed and budget for three.
    use windlass_db::queries::{tasks as task_db, workflows as workflow_db};
    workflow_db::ensure_workflow(&pool, "wf-crash", None).await.unwrap();
    workflow_db::transition_workflow_status(
        &pool,
        "wf-crash",
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        Some(chrono::Utc::now()),
        None,
    )
    .await
    .unwrap();
    task_db::ensure_task(&pool, "wf-crash", "t1").await.unwrap();
    task_db::begin_task_attempt(&pool, "wf-crash", "t1", TaskStatus::Pending, 0)
        .await
        .unwrap();

    let spec = WorkflowSpec::new("wf-crash", "crashy").with_task(
        Task::new("t1", "orphan").with_retry(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
            backoff_multiplier: 2.0,
            jitter: false,
        }),
    );

    let view = orchestrator.execute(&spec).await.unwrap();
    let t1 = view.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Completed);
    // The interrupted attempt still counts against the budget.
    assert_eq!(t1.attempt, 2);
    assert_eq!(executor.count("t1").await, 1);
}

#[tokio::test]
async fn orphan_with_no_budget_fails_the_workflow() {
    windlass_test_utils::init_tracing();
    let (pool, _dir) = create_test_db().await;
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Orchestrator::builder()
        .pool(pool.clone())
        .executor(executor.clone())
        .event_log(Arc::new(MemoryEventLog::new()))
        .build()
        .unwrap();

    use windlass_db::queries::{tasks as task_db, workflows as workflow_db};
    workflow_db::ensure_workflow(&pool, "wf-crash-dead", None).await.unwrap();
    workflow_db::transition_workflow_status(
        &pool,
        "wf-crash-dead",
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        Some(chrono::Utc::now()),
        None,
    )
    .await
    .unwrap();
    task_db::ensure_task(&pool, "wf-crash-dead", "t1").await.unwrap();
    task_db::begin_task_attempt(&pool, "wf-crash-dead", "t1", TaskStatus::Pending, 0)
        .await
        .unwrap();

    // Single-attempt budget: the interrupted attempt was the only one.
    let spec = WorkflowSpec::new("wf-crash-dead", "crashy").with_task(Task::new("t1", "orphan"));

    let err = orchestrator.execute(&spec).await.unwrap_err();
    assert!(matches!(err, WorkflowError::TaskFailed { .. }));
    assert_eq!(executor.count("t1").await, 0);

    let view = orchestrator
        .get_state("wf-crash-dead", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.state.status, WorkflowStatus::Failed);
    assert_eq!(view.task("t1").unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn cyclic_spec_is_rejected_before_execution() {
    let rig = rig(ScriptedExecutor::new()).await;
    let spec = WorkflowSpec::new("wf-cycle", "cycle")
        .with_task(Task::new("a", "A"))
        .with_task(Task::new("b", "B"))
        .with_dependency("a", "b")
        .with_dependency("b", "a");

    let err = rig.orchestrator.execute(&spec).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Invalid(_)));
    // Nothing was persisted or executed.
    assert!(rig.orchestrator.get_state("wf-cycle", None).await.unwrap().is_none());
    assert_eq!(rig.executor.order().await.len(), 0);
}
