//! The append-only event stream: one causally-ordered sequence per workflow.
//!
//! Every orchestration step appends an [`EventRecord`]; the log is the
//! durable audit trail and the recovery input. Appends are best-effort from
//! the orchestrator's perspective (a log failure is logged, never fails the
//! task), but the provided implementations only fail on I/O errors.

pub mod journal;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

pub use journal::FileEventLog;

/// Every event the kernel can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetry,
    TaskTimeout,
    StateSnapshot,
    StateUpdated,
    CompensationTriggered,
    CompensationCompleted,
    CompensationFailed,
    FaultInjected,
    DeadlockDetected,
    LockAcquired,
    LockReleased,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetry => "task_retry",
            Self::TaskTimeout => "task_timeout",
            Self::StateSnapshot => "state_snapshot",
            Self::StateUpdated => "state_updated",
            Self::CompensationTriggered => "compensation_triggered",
            Self::CompensationCompleted => "compensation_completed",
            Self::CompensationFailed => "compensation_failed",
            Self::FaultInjected => "fault_injected",
            Self::DeadlockDetected => "deadlock_detected",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow_started" => Ok(Self::WorkflowStarted),
            "workflow_completed" => Ok(Self::WorkflowCompleted),
            "workflow_failed" => Ok(Self::WorkflowFailed),
            "task_started" => Ok(Self::TaskStarted),
            "task_completed" => Ok(Self::TaskCompleted),
            "task_failed" => Ok(Self::TaskFailed),
            "task_retry" => Ok(Self::TaskRetry),
            "task_timeout" => Ok(Self::TaskTimeout),
            "state_snapshot" => Ok(Self::StateSnapshot),
            "state_updated" => Ok(Self::StateUpdated),
            "compensation_triggered" => Ok(Self::CompensationTriggered),
            "compensation_completed" => Ok(Self::CompensationCompleted),
            "compensation_failed" => Ok(Self::CompensationFailed),
            "fault_injected" => Ok(Self::FaultInjected),
            "deadlock_detected" => Ok(Self::DeadlockDetected),
            "lock_acquired" => Ok(Self::LockAcquired),
            "lock_released" => Ok(Self::LockReleased),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

/// One record in a workflow's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl EventRecord {
    /// A workflow-level event (no task id).
    pub fn workflow(
        event_type: EventType,
        workflow_id: impl Into<String>,
        tenant_id: Option<String>,
        metadata: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            workflow_id: workflow_id.into(),
            task_id: None,
            tenant_id,
            metadata,
        }
    }

    /// A task-level event.
    pub fn task(
        event_type: EventType,
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        tenant_id: Option<String>,
        metadata: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            workflow_id: workflow_id.into(),
            task_id: Some(task_id.into()),
            tenant_id,
            metadata,
        }
    }
}

/// Append-only event sink with tenant-filtered reads.
///
/// # Object Safety
///
/// This trait is object-safe so the orchestrator can hold it as
/// `Arc<dyn EventLog>`.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one record to the workflow's stream.
    async fn append(&self, record: EventRecord) -> anyhow::Result<()>;

    /// Read a workflow's stream in append order.
    ///
    /// When `tenant_id` is `Some`, only records carrying that tenant are
    /// returned (possibly the empty set). `None` is an administrative read.
    async fn read(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> anyhow::Result<Vec<EventRecord>>;
}

// Compile-time assertion: EventLog must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn EventLog) {}
};

/// In-memory event log, mainly for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records across all workflows, in append order.
    pub async fn all(&self) -> Vec<EventRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, record: EventRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn read(
        &self,
        workflow_id: &str,
        tenant_id: Option<&str>,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .filter(|r| match tenant_id {
                None => true,
                Some(tenant) => r.tenant_id.as_deref() == Some(tenant),
            })
            .cloned()
            .collect())
    }
}
