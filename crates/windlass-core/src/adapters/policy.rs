//! Policy gate: `can this principal run this task at all?`

use async_trait::async_trait;

use crate::spec::Task;

/// The gate's answer for one (principal, task) pair.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Permission gate consulted before any other pipeline step.
///
/// A deny fails the task with `POLICY_BLOCKED` and nothing else runs.
#[async_trait]
pub trait PolicyGuard: Send + Sync {
    async fn check(&self, principal: &str, task: &Task) -> anyhow::Result<PolicyDecision>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PolicyGuard) {}
};
