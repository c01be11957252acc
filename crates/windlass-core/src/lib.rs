//! windlass-core: a durable workflow orchestration kernel.
//!
//! Takes a declarative [`spec::WorkflowSpec`] (a DAG of tasks) and executes
//! it with deterministic dependency ordering, retry with backoff, per-task
//! timeouts, saga compensation, exactly-once side effects through an
//! idempotency-keyed outbox, resource coordination with deadlock/livelock
//! detection, and an append-only event journal for recovery and audit.

pub mod adapters;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod feasibility;
pub mod orchestrator;
pub mod outbox;
pub mod spec;
pub mod state;
pub mod world;

pub use error::{TaskFailure, WorkflowError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig, WorkflowView};
pub use spec::{Task, WorkflowSpec};
