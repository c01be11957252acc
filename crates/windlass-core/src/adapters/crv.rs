//! Commit/Result Validation (CRV): a pluggable post-execution gate that can
//! block a task result and trigger recovery.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The unit the gate validates: a task's produced result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub workflow_id: String,
    pub task_id: String,
    pub data: Value,
}

/// How a blocked commit should be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryAltTool,
    AskUser,
    Escalate,
    /// Accept the original data despite the validation failure.
    Ignore,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetryAltTool => "retry_alt_tool",
            Self::AskUser => "ask_user",
            Self::Escalate => "escalate",
            Self::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

impl FromStr for RecoveryStrategy {
    type Err = RecoveryStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry_alt_tool" => Ok(Self::RetryAltTool),
            "ask_user" => Ok(Self::AskUser),
            "escalate" => Ok(Self::Escalate),
            "ignore" => Ok(Self::Ignore),
            other => Err(RecoveryStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RecoveryStrategy`] string.
#[derive(Debug, Clone)]
pub struct RecoveryStrategyParseError(pub String);

impl fmt::Display for RecoveryStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid recovery strategy: {:?}", self.0)
    }
}

impl std::error::Error for RecoveryStrategyParseError {}

/// The gate's verdict on a commit.
#[derive(Debug, Clone)]
pub struct CrvOutcome {
    pub passed: bool,
    pub blocked: bool,
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Arguments forwarded to the recovery executor.
    pub recovery_args: Option<Value>,
    pub failure_code: Option<String>,
}

impl CrvOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            blocked: false,
            recovery_strategy: None,
            recovery_args: None,
            failure_code: None,
        }
    }

    pub fn block(failure_code: impl Into<String>, strategy: Option<RecoveryStrategy>) -> Self {
        Self {
            passed: false,
            blocked: true,
            recovery_strategy: strategy,
            recovery_args: None,
            failure_code: Some(failure_code.into()),
        }
    }
}

/// Result of a recovery dispatch.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub success: bool,
    /// Replacement data that retroactively becomes the task result.
    pub recovered_data: Option<Value>,
}

/// The validation gate itself.
#[async_trait]
pub trait CrvGate: Send + Sync {
    async fn validate(&self, commit: &Commit) -> anyhow::Result<CrvOutcome>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn CrvGate) {}
};

/// Strategy-specific recovery for blocked commits.
///
/// `ignore` needs no executor: the orchestrator commits the original data.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn retry_alt_tool(&self, args: &Value, commit: &Commit) -> anyhow::Result<Recovery>;
    async fn ask_user(&self, args: &Value, commit: &Commit) -> anyhow::Result<Recovery>;
    async fn escalate(&self, args: &Value, commit: &Commit) -> anyhow::Result<Recovery>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn RecoveryExecutor) {}
};
