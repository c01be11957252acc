//! External memory store: episodic notes, artifacts, and snapshots written
//! during task lifecycles.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait MemoryApi: Send + Sync {
    async fn write_episodic_note(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
        tag: &str,
        content: &Value,
    ) -> anyhow::Result<()>;

    async fn write_artifact(
        &self,
        workflow_id: &str,
        name: &str,
        content: &Value,
    ) -> anyhow::Result<()>;

    async fn write_snapshot(&self, workflow_id: &str, content: &Value) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn MemoryApi) {}
};
