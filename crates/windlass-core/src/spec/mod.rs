//! The declarative workflow spec: a DAG of tasks with per-task execution
//! policy (retry, timeout, risk, compensation, locks).
//!
//! Specs are immutable inputs. Validation lives in [`validate`]; the
//! orchestrator refuses to run a spec that does not pass it.

pub mod validate;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::LockMode;

/// Kind of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Action,
    Decision,
    Wait,
    Compensation,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Action => "action",
            Self::Decision => "decision",
            Self::Wait => "wait",
            Self::Compensation => "compensation",
        };
        f.write_str(s)
    }
}

/// Risk tier of a task or tool. Ordered: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A permission a task requires from the policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub action: String,
    pub resource: String,
}

/// Retry policy for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Must be >= 1.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub backoff_ms: u64,
    /// Multiplier applied per attempt: delay = backoff_ms * multiplier^(n-1).
    pub backoff_multiplier: f64,
    /// Scale the delay by uniform(0.5, 1.5) to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// A user-supplied inverse action, invoked during saga rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    pub tool: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
}

/// Tool names invoked when a task fails or times out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationHooks {
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub on_timeout: Option<String>,
}

/// A resource lock a task needs for the duration of its execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource_id: String,
    pub mode: LockMode,
}

/// Sandbox flags forwarded to the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub network_allowed: bool,
}

/// A single task in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the workflow.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub task_type: TaskType,
    /// The external tool this task invokes, if any.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub required_permissions: Vec<Permission>,
    /// When set, the task may only invoke tools on this list.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicit idempotency key; derived from workflow/task/inputs when
    /// absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub compensation_action: Option<CompensationAction>,
    #[serde(default)]
    pub compensation_hooks: CompensationHooks,
    #[serde(default)]
    pub locks: Vec<LockRequest>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Task {
    /// A minimal action task. The builder-style `with_*` methods fill in the
    /// rest.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task_type: TaskType::default(),
            tool: None,
            inputs: BTreeMap::new(),
            risk_tier: RiskTier::default(),
            required_permissions: Vec::new(),
            allowed_tools: None,
            retry: RetryPolicy::default(),
            timeout_ms: None,
            idempotency_key: None,
            compensation_action: None,
            compensation_hooks: CompensationHooks::default(),
            locks: Vec::new(),
            sandbox: SandboxConfig::default(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_risk_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = tier;
        self
    }

    pub fn with_compensation(mut self, action: CompensationAction) -> Self {
        self.compensation_action = Some(action);
        self
    }

    pub fn with_timeout_hook(mut self, tool: impl Into<String>) -> Self {
        self.compensation_hooks.on_timeout = Some(tool.into());
        self
    }

    pub fn with_failure_hook(mut self, tool: impl Into<String>) -> Self {
        self.compensation_hooks.on_failure = Some(tool.into());
        self
    }

    pub fn with_lock(mut self, resource_id: impl Into<String>, mode: LockMode) -> Self {
        self.locks.push(LockRequest {
            resource_id: resource_id.into(),
            mode,
        });
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }
}

/// A declarative workflow: tasks plus a dependency map
/// (task id -> prerequisite task ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

impl WorkflowSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tenant_id: None,
            tasks: Vec::new(),
            dependencies: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare that `task_id` depends on `prerequisite`.
    pub fn with_dependency(
        mut self,
        task_id: impl Into<String>,
        prerequisite: impl Into<String>,
    ) -> Self {
        self.dependencies
            .entry(task_id.into())
            .or_default()
            .push(prerequisite.into());
        self
    }

    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// The prerequisite ids of a task (empty when it has none).
    pub fn prerequisites(&self, task_id: &str) -> &[String] {
        self.dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
