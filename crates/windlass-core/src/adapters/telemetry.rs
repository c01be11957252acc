//! Best-effort telemetry sink.
//!
//! Failures here are logged and swallowed; telemetry must never cause a
//! task failure.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait TelemetryCollector: Send + Sync {
    async fn record_event(&self, name: &str, attributes: &Value) -> anyhow::Result<()>;
    async fn record_metric(&self, name: &str, value: f64, attributes: &Value)
    -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn TelemetryCollector) {}
};
