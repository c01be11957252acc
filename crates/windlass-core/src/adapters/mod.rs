//! Interfaces for the kernel's external collaborators.
//!
//! Each collaborator is an object-safe trait with a small capability
//! surface; the orchestrator holds them as optional `Arc<dyn ...>` fields
//! and skips the corresponding pipeline step when one is absent.

pub mod crv;
pub mod fault;
pub mod memory;
pub mod policy;
pub mod telemetry;
pub mod tools;

pub use crv::{Commit, CrvGate, CrvOutcome, Recovery, RecoveryExecutor, RecoveryStrategy};
pub use fault::{FaultDecision, FaultInjector};
pub use memory::MemoryApi;
pub use policy::{PolicyDecision, PolicyGuard};
pub use telemetry::TelemetryCollector;
pub use tools::{ConstraintEngine, ConstraintOutcome, StaticToolRegistry, ToolInfo, ToolRegistry};
