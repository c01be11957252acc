//! The `TaskExecutor` trait -- the adapter interface for tool backends.
//!
//! Each concrete executor wraps whatever actually performs side effects (an
//! HTTP client, a sandbox runner, a tool router) and translates a
//! [`ToolInvocation`] into a JSON result. All executor calls flow through the
//! outbox, so implementations never need their own replay protection.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::spec::SandboxConfig;

/// Everything an executor needs to perform one tool call.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub workflow_id: String,
    pub task_id: String,
    /// Tool id; synthesized from the task type for tool-less tasks.
    pub tool: String,
    /// The task inputs (or compensation args) as a JSON object.
    pub params: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub sandbox: SandboxConfig,
}

/// Adapter interface for executing tool calls.
///
/// Implementations should watch `cancel`: when the orchestrator's deadline
/// expires it cancels the token and abandons the call, and any side effect
/// that did not reach the outbox's committed state will be retried or
/// compensated. Ignoring the token is allowed but wasteful.
///
/// # Object Safety
///
/// This trait is object-safe so executors can be stored as
/// `Arc<dyn TaskExecutor>`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        cancel: CancellationToken,
    ) -> anyhow::Result<Value>;
}

// Compile-time assertion: TaskExecutor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskExecutor) {}
};
