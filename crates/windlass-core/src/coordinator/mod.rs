//! Multi-agent resource coordination: non-blocking locks under per-resource
//! policies, a wait-for graph for deadlock detection, windowed livelock
//! detection, and mitigation strategies.
//!
//! The coordinator is in-process; cross-process lock ownership is out of
//! scope. Lock grants and releases append `lock_acquired` / `lock_released`
//! events when an event log is attached.

pub mod deadlock;
pub mod livelock;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{EventLog, EventRecord, EventType};

pub use deadlock::DeadlockDetection;
pub use livelock::{
    LivelockConfig, LivelockDetection, LivelockDetector, VOLATILE_KEYS, state_signature,
};

/// Lock mode requested by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

impl FromStr for LockMode {
    type Err = LockModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(LockModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LockMode`] string.
#[derive(Debug, Clone)]
pub struct LockModeParseError(pub String);

impl fmt::Display for LockModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lock mode: {:?}", self.0)
    }
}

impl std::error::Error for LockModeParseError {}

/// Coordination policy type for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// At most one holder, regardless of mode.
    Exclusive,
    /// Unlimited readers or one writer, never both.
    Shared,
}

/// Per-resource coordination policy.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    pub kind: PolicyKind,
    /// Cap on concurrent readers under [`PolicyKind::Shared`].
    pub max_concurrent_access: Option<usize>,
    /// Absolute lifetime of a grant; expired grants are reaped.
    pub lock_timeout: Option<Duration>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self::shared()
    }
}

impl ResourcePolicy {
    pub fn exclusive() -> Self {
        Self {
            kind: PolicyKind::Exclusive,
            max_concurrent_access: None,
            lock_timeout: None,
        }
    }

    pub fn shared() -> Self {
        Self {
            kind: PolicyKind::Shared,
            max_concurrent_access: None,
            lock_timeout: None,
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_access = Some(max);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// A granted lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    pub agent_id: String,
    pub workflow_id: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
}

/// A denied request, recorded for the wait-for graph. The mode is not
/// stored; a poll re-presents it on the next `acquire_lock` call.
#[derive(Debug, Clone)]
struct WaitRequest {
    agent_id: String,
    workflow_id: String,
}

/// Mitigation strategy for detected deadlocks and livelocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitigationStrategy {
    /// Release a victim's locks and mark its workflows for failure.
    Abort,
    /// Release the victim's locks and clear its history so the caller can
    /// retry with an altered plan.
    Replan,
    /// Invoke the registered escalation handler with full context.
    Escalate,
    /// Do nothing; the caller reschedules detection.
    Wait,
}

/// Context handed to an escalation handler.
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub kind: ContentionKind,
    pub agents: Vec<String>,
    pub resources: Vec<String>,
    pub details: Value,
}

/// Which detector raised the escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionKind {
    Deadlock,
    Livelock,
}

/// Callback invoked for [`MitigationStrategy::Escalate`]. Invocation is
/// synchronous from the mitigator's perspective; the body may suspend.
#[async_trait::async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn escalate(&self, context: EscalationContext);
}

const _: () = {
    fn _assert_object_safe(_: &dyn EscalationHandler) {}
};

/// What a mitigation did.
#[derive(Debug, Clone)]
pub struct MitigationOutcome {
    pub strategy: MitigationStrategy,
    pub victim: Option<String>,
    pub released: Vec<Lock>,
    /// Workflows marked for failure (ABORT only).
    pub workflows_marked: Vec<String>,
}

#[derive(Default)]
struct CoordState {
    policies: HashMap<String, ResourcePolicy>,
    grants: HashMap<String, Vec<Lock>>,
    waiting: HashMap<String, Vec<WaitRequest>>,
    aborted_workflows: HashSet<String>,
}

/// The multi-agent coordinator.
pub struct Coordinator {
    state: Mutex<CoordState>,
    livelock: Mutex<LivelockDetector>,
    event_log: Option<Arc<dyn EventLog>>,
    escalation: std::sync::Mutex<Option<Arc<dyn EscalationHandler>>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordState::default()),
            livelock: Mutex::new(LivelockDetector::new(LivelockConfig::default())),
            event_log: None,
            escalation: std::sync::Mutex::new(None),
        }
    }

    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn with_livelock_config(mut self, config: LivelockConfig) -> Self {
        self.livelock = Mutex::new(LivelockDetector::new(config));
        self
    }

    /// Register the escalation handler.
    pub fn set_escalation_handler(&self, handler: Arc<dyn EscalationHandler>) {
        *self.escalation.lock().expect("escalation mutex poisoned") = Some(handler);
    }

    /// Set (or replace) a resource's coordination policy.
    pub async fn set_policy(&self, resource_id: &str, policy: ResourcePolicy) {
        self.state
            .lock()
            .await
            .policies
            .insert(resource_id.to_owned(), policy);
    }

    /// Try to acquire a lock without blocking.
    ///
    /// Returns `true` when granted. A denied request is recorded in the
    /// wait-for graph; callers poll (or give up and `cancel_wait`).
    /// Re-acquiring an already-held lock is an idempotent success.
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        agent_id: &str,
        workflow_id: &str,
        mode: LockMode,
    ) -> bool {
        let mut event = None;
        let granted = {
            let mut state = self.state.lock().await;
            let policy = state
                .policies
                .get(resource_id)
                .cloned()
                .unwrap_or_default();

            let held = state.grants.get(resource_id).is_some_and(|holders| {
                holders
                    .iter()
                    .any(|l| l.agent_id == agent_id && l.workflow_id == workflow_id)
            });
            if held {
                true
            } else {
                let compatible = {
                    let holders = state
                        .grants
                        .get(resource_id)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    is_compatible(&policy, holders, mode)
                };
                if compatible {
                    let now = Utc::now();
                    let lock = Lock {
                        resource_id: resource_id.to_owned(),
                        agent_id: agent_id.to_owned(),
                        workflow_id: workflow_id.to_owned(),
                        mode,
                        acquired_at: now,
                        timeout_at: policy
                            .lock_timeout
                            .and_then(|d| chrono::Duration::from_std(d).ok())
                            .map(|d| now + d),
                    };
                    state
                        .grants
                        .entry(resource_id.to_owned())
                        .or_default()
                        .push(lock.clone());
                    if let Some(waits) = state.waiting.get_mut(resource_id) {
                        waits.retain(|w| w.agent_id != agent_id);
                    }
                    event = Some(EventRecord::workflow(
                        EventType::LockAcquired,
                        workflow_id,
                        None,
                        json!({
                            "resource_id": resource_id,
                            "agent_id": agent_id,
                            "mode": mode.to_string(),
                        }),
                    ));
                    true
                } else {
                    let waits = state.waiting.entry(resource_id.to_owned()).or_default();
                    if !waits.iter().any(|w| w.agent_id == agent_id) {
                        waits.push(WaitRequest {
                            agent_id: agent_id.to_owned(),
                            workflow_id: workflow_id.to_owned(),
                        });
                    }
                    false
                }
            }
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
        granted
    }

    /// Release a grant. Wait-for edges from the released lock dissolve
    /// automatically because the graph is derived from live grants.
    pub async fn release_lock(&self, resource_id: &str, agent_id: &str, workflow_id: &str) -> bool {
        let released = {
            let mut state = self.state.lock().await;
            let Some(holders) = state.grants.get_mut(resource_id) else {
                return false;
            };
            let before = holders.len();
            holders.retain(|l| !(l.agent_id == agent_id && l.workflow_id == workflow_id));
            let removed = before != holders.len();
            if holders.is_empty() {
                state.grants.remove(resource_id);
            }
            removed
        };
        if released {
            self.emit(EventRecord::workflow(
                EventType::LockReleased,
                workflow_id,
                None,
                json!({
                    "resource_id": resource_id,
                    "agent_id": agent_id,
                    "reason": "released",
                }),
            ))
            .await;
        }
        released
    }

    /// Withdraw a pending (denied) request from the wait-for graph.
    pub async fn cancel_wait(&self, resource_id: &str, agent_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(waits) = state.waiting.get_mut(resource_id) {
            waits.retain(|w| w.agent_id != agent_id);
            if waits.is_empty() {
                state.waiting.remove(resource_id);
            }
        }
    }

    /// Current grants on a resource (introspection, tests).
    pub async fn locks_for(&self, resource_id: &str) -> Vec<Lock> {
        self.state
            .lock()
            .await
            .grants
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Revoke every grant past its `timeout_at`, emitting `lock_released`
    /// with reason `timeout`. Returns the reaped locks.
    pub async fn reap_expired(&self) -> Vec<Lock> {
        let now = Utc::now();
        let reaped = {
            let mut state = self.state.lock().await;
            let mut reaped = Vec::new();
            for holders in state.grants.values_mut() {
                holders.retain(|l| {
                    let expired = l.timeout_at.is_some_and(|at| at <= now);
                    if expired {
                        reaped.push(l.clone());
                    }
                    !expired
                });
            }
            state.grants.retain(|_, holders| !holders.is_empty());
            reaped
        };
        for lock in &reaped {
            warn!(
                resource_id = %lock.resource_id,
                agent_id = %lock.agent_id,
                "reaping expired lock"
            );
            self.emit(EventRecord::workflow(
                EventType::LockReleased,
                &lock.workflow_id,
                None,
                json!({
                    "resource_id": lock.resource_id,
                    "agent_id": lock.agent_id,
                    "reason": "timeout",
                }),
            ))
            .await;
        }
        reaped
    }

    /// Background reaper loop; run until cancelled.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.reap_expired().await;
                }
            }
        }
    }

    /// Build the wait-for graph and return the first cycle found, if any.
    ///
    /// Emits `deadlock_detected` for every workflow involved in the cycle.
    pub async fn detect_deadlock(&self) -> Option<DeadlockDetection> {
        let (cycle, resources, workflows) = {
            let state = self.state.lock().await;
            let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (resource, waits) in &state.waiting {
                let Some(holders) = state.grants.get(resource) else {
                    continue;
                };
                for wait in waits {
                    for holder in holders {
                        if wait.agent_id != holder.agent_id {
                            edges
                                .entry(wait.agent_id.clone())
                                .or_default()
                                .insert(holder.agent_id.clone());
                        }
                    }
                }
            }

            let cycle = deadlock::find_cycle(&edges)?;
            let cycle_set: HashSet<&str> = cycle.iter().map(String::as_str).collect();

            let mut resources: Vec<String> = state
                .waiting
                .iter()
                .filter(|(resource, waits)| {
                    waits.iter().any(|w| cycle_set.contains(w.agent_id.as_str()))
                        && state.grants.get(*resource).is_some_and(|holders| {
                            holders.iter().any(|h| cycle_set.contains(h.agent_id.as_str()))
                        })
                })
                .map(|(resource, _)| resource.clone())
                .collect();
            resources.sort();

            let mut workflows: BTreeSet<String> = BTreeSet::new();
            for holders in state.grants.values() {
                for lock in holders {
                    if cycle_set.contains(lock.agent_id.as_str()) {
                        workflows.insert(lock.workflow_id.clone());
                    }
                }
            }
            for waits in state.waiting.values() {
                for wait in waits {
                    if cycle_set.contains(wait.agent_id.as_str()) {
                        workflows.insert(wait.workflow_id.clone());
                    }
                }
            }

            (cycle, resources, workflows)
        };

        info!(cycle = ?cycle, resources = ?resources, "deadlock detected");
        for workflow_id in &workflows {
            self.emit(EventRecord::workflow(
                EventType::DeadlockDetected,
                workflow_id,
                None,
                json!({"cycle": cycle, "resources": resources}),
            ))
            .await;
        }

        Some(DeadlockDetection { cycle, resources })
    }

    /// Report an agent's state for livelock tracking.
    pub async fn record_state(
        &self,
        agent_id: &str,
        workflow_id: &str,
        task_id: &str,
        state: &Value,
    ) {
        self.livelock
            .lock()
            .await
            .record(agent_id, workflow_id, task_id, state);
    }

    /// Check one agent for livelock.
    pub async fn detect_livelock(&self, agent_id: &str) -> Option<LivelockDetection> {
        self.livelock.lock().await.detect(agent_id)
    }

    /// Check all tracked agents for livelock, lowest agent id first.
    pub async fn detect_any_livelock(&self) -> Option<LivelockDetection> {
        self.livelock.lock().await.detect_any()
    }

    /// Mitigate a detected deadlock.
    pub async fn mitigate_deadlock(
        &self,
        detection: &DeadlockDetection,
        strategy: MitigationStrategy,
    ) -> MitigationOutcome {
        self.mitigate(
            strategy,
            ContentionKind::Deadlock,
            detection.cycle.clone(),
            detection.resources.clone(),
            json!({"cycle": detection.cycle, "resources": detection.resources}),
        )
        .await
    }

    /// Mitigate a detected livelock.
    pub async fn mitigate_livelock(
        &self,
        detection: &LivelockDetection,
        strategy: MitigationStrategy,
    ) -> MitigationOutcome {
        self.mitigate(
            strategy,
            ContentionKind::Livelock,
            vec![detection.agent_id.clone()],
            Vec::new(),
            json!({
                "agent_id": detection.agent_id,
                "cycle": detection.cycle,
                "repeats": detection.repeats,
            }),
        )
        .await
    }

    async fn mitigate(
        &self,
        strategy: MitigationStrategy,
        kind: ContentionKind,
        agents: Vec<String>,
        resources: Vec<String>,
        details: Value,
    ) -> MitigationOutcome {
        match strategy {
            MitigationStrategy::Wait => MitigationOutcome {
                strategy,
                victim: None,
                released: Vec::new(),
                workflows_marked: Vec::new(),
            },
            MitigationStrategy::Escalate => {
                let handler = self
                    .escalation
                    .lock()
                    .expect("escalation mutex poisoned")
                    .clone();
                if let Some(handler) = handler {
                    handler
                        .escalate(EscalationContext {
                            kind,
                            agents,
                            resources,
                            details,
                        })
                        .await;
                } else {
                    warn!("escalation requested but no handler is registered");
                }
                MitigationOutcome {
                    strategy,
                    victim: None,
                    released: Vec::new(),
                    workflows_marked: Vec::new(),
                }
            }
            MitigationStrategy::Abort | MitigationStrategy::Replan => {
                // Deterministic victim selection: lowest agent id.
                let victim = agents.iter().min().cloned();
                let Some(victim) = victim else {
                    return MitigationOutcome {
                        strategy,
                        victim: None,
                        released: Vec::new(),
                        workflows_marked: Vec::new(),
                    };
                };

                let (released, workflows) = {
                    let mut state = self.state.lock().await;
                    let mut released = Vec::new();
                    for holders in state.grants.values_mut() {
                        holders.retain(|l| {
                            let is_victim = l.agent_id == victim;
                            if is_victim {
                                released.push(l.clone());
                            }
                            !is_victim
                        });
                    }
                    state.grants.retain(|_, holders| !holders.is_empty());

                    let mut workflows: BTreeSet<String> =
                        released.iter().map(|l| l.workflow_id.clone()).collect();
                    for waits in state.waiting.values_mut() {
                        waits.retain(|w| {
                            if w.agent_id == victim {
                                workflows.insert(w.workflow_id.clone());
                                false
                            } else {
                                true
                            }
                        });
                    }
                    state.waiting.retain(|_, waits| !waits.is_empty());

                    if strategy == MitigationStrategy::Abort {
                        for workflow in &workflows {
                            state.aborted_workflows.insert(workflow.clone());
                        }
                    }
                    (released, workflows)
                };

                if strategy == MitigationStrategy::Replan {
                    self.livelock.lock().await.clear(&victim);
                }

                let reason = match strategy {
                    MitigationStrategy::Abort => "abort",
                    _ => "replan",
                };
                for lock in &released {
                    self.emit(EventRecord::workflow(
                        EventType::LockReleased,
                        &lock.workflow_id,
                        None,
                        json!({
                            "resource_id": lock.resource_id,
                            "agent_id": lock.agent_id,
                            "reason": reason,
                        }),
                    ))
                    .await;
                }

                info!(victim = %victim, strategy = ?strategy, "mitigated contention");
                MitigationOutcome {
                    strategy,
                    victim: Some(victim),
                    released,
                    workflows_marked: if strategy == MitigationStrategy::Abort {
                        workflows.into_iter().collect()
                    } else {
                        Vec::new()
                    },
                }
            }
        }
    }

    /// Whether an ABORT mitigation marked this workflow for failure.
    pub async fn is_workflow_aborted(&self, workflow_id: &str) -> bool {
        self.state
            .lock()
            .await
            .aborted_workflows
            .contains(workflow_id)
    }

    /// Drain the set of workflows marked for failure.
    pub async fn take_aborted_workflows(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut workflows: Vec<String> = state.aborted_workflows.drain().collect();
        workflows.sort();
        workflows
    }

    async fn emit(&self, record: EventRecord) {
        if let Some(log) = &self.event_log {
            if let Err(e) = log.append(record).await {
                warn!(error = %e, "failed to append coordination event");
            }
        }
    }
}

/// The lock compatibility matrix.
fn is_compatible(policy: &ResourcePolicy, holders: &[Lock], mode: LockMode) -> bool {
    if holders.is_empty() {
        return true;
    }
    match policy.kind {
        PolicyKind::Exclusive => false,
        PolicyKind::Shared => match mode {
            LockMode::Write => false,
            LockMode::Read => {
                holders.iter().all(|l| l.mode == LockMode::Read)
                    && policy
                        .max_concurrent_access
                        .is_none_or(|max| holders.len() < max)
            }
        },
    }
}
