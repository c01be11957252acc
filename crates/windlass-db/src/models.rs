use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether the workflow can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl TaskStatus {
    /// Whether the task can never run again within this workflow instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// State of an outbox entry (the side-effect intent log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Processing,
    Committed,
    Failed,
    DeadLetter,
}

impl OutboxState {
    /// Whether the entry can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::DeadLetter)
    }
}

impl fmt::Display for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxState {
    type Err = OutboxStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(OutboxStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OutboxState`] string.
#[derive(Debug, Clone)]
pub struct OutboxStateParseError(pub String);

impl fmt::Display for OutboxStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid outbox state: {:?}", self.0)
    }
}

impl std::error::Error for OutboxStateParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow instance -- the top-level unit of execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub tenant_id: Option<String>,
    pub status: WorkflowStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Execution state of a single task within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskState {
    pub workflow_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    /// 1-based count of executions; 0 until the first attempt starts.
    pub attempt: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A side-effect intent recorded in the outbox.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub workflow_id: String,
    pub task_id: String,
    pub tool_id: String,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub state: OutboxState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// The current (or a historical) value of a world-state key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorldEntry {
    pub key: String,
    pub version: i64,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
