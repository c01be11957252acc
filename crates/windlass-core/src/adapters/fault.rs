//! Fault injection hook, consulted before each execution attempt.

use std::time::Duration;

use async_trait::async_trait;

/// What the injector wants done before the attempt proceeds.
#[derive(Debug, Clone)]
pub enum FaultDecision {
    /// No fault; execute normally.
    Proceed,
    /// Sleep this long, then execute normally.
    Delay(Duration),
    /// Raise a synthetic failure instead of executing.
    Fail(String),
}

/// Synthetic-fault source for chaos and recovery testing.
///
/// Consulted once per attempt; an active fault emits a `fault_injected`
/// event and, for [`FaultDecision::Fail`], counts as an attempt failure
/// subject to the task's normal retry policy.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn inject_before_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        tool: Option<&str>,
    ) -> FaultDecision;
}

const _: () = {
    fn _assert_object_safe(_: &dyn FaultInjector) {}
};
