//! Error taxonomy for workflow execution.
//!
//! Per-task failures are [`TaskFailure`] variants; they are recorded on the
//! task's state and recovered locally (retry, compensation, CRV recovery)
//! where possible. Only when local recovery is exhausted does the
//! orchestrator surface a terminal [`WorkflowError::TaskFailed`] carrying the
//! failing task id and the original cause.

use thiserror::Error;

use crate::spec::RiskTier;
use crate::spec::validate::SpecError;

/// The ways a single task can fail.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("policy blocked: {reason}")]
    PolicyBlocked { reason: String },

    #[error("feasibility check failed: {}", reasons.join("; "))]
    FeasibilityFailed { reasons: Vec<String> },

    #[error("tool {tool:?} is not available")]
    ToolUnavailable { tool: String },

    #[error("tool {tool:?} risk {tool_risk} exceeds task tier {task_tier}")]
    RiskExceedsTier {
        tool: String,
        tool_risk: RiskTier,
        task_tier: RiskTier,
    },

    #[error("tool execution failed: {0}")]
    ToolError(anyhow::Error),

    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("injected fault: {0}")]
    FaultInjected(String),

    #[error("commit validation blocked ({failure_code})")]
    CrvBlocked { failure_code: String },

    #[error("commit recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("compensation for task {task_id} failed: {error}")]
    CompensationFailed { task_id: String, error: String },

    #[error("timed out waiting for lock on {resource_id}")]
    LockTimeout { resource_id: String },

    #[error("deadlock involving agents: {}", cycle.join(" -> "))]
    Deadlock { cycle: Vec<String> },

    #[error("livelock detected for agent {agent_id}")]
    Livelock { agent_id: String },

    #[error("dependency {dependency} did not complete")]
    DependencyUnmet { dependency: String },

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl TaskFailure {
    /// Stable machine-readable code, recorded in task errors and event
    /// metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PolicyBlocked { .. } => "POLICY_BLOCKED",
            Self::FeasibilityFailed { .. } => "FEASIBILITY_FAILED",
            Self::ToolUnavailable { .. } => "TOOL_UNAVAILABLE",
            Self::RiskExceedsTier { .. } => "RISK_EXCEEDS_TIER",
            Self::ToolError(_) => "TOOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::FaultInjected(_) => "FAULT_INJECTED",
            Self::CrvBlocked { .. } => "CRV_BLOCKED",
            Self::RecoveryFailed(_) => "RECOVERY_FAILED",
            Self::CompensationFailed { .. } => "COMPENSATION_FAILED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Deadlock { .. } => "DEADLOCK",
            Self::Livelock { .. } => "LIVELOCK",
            Self::DependencyUnmet { .. } => "DEPENDENCY_UNMET",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether another attempt could plausibly change the outcome.
    ///
    /// Policy and feasibility denials are deterministic and never retried;
    /// CRV blocks are not retried either, because the outbox would replay
    /// the committed result instead of re-running the tool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ToolError(_) | Self::Timeout { .. } | Self::FaultInjected(_)
        )
    }

    /// The audit string stored on `task_state.error`: code plus detail.
    pub fn audit_message(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

/// Terminal errors surfaced by `Orchestrator::execute`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Invalid(#[from] SpecError),

    #[error("task {task_id} in workflow {workflow_id} failed: {failure}")]
    TaskFailed {
        workflow_id: String,
        task_id: String,
        #[source]
        failure: TaskFailure,
    },

    #[error("workflow {0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(anyhow::Error),
}

impl WorkflowError {
    /// Convenience for mapping db-layer errors.
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}
