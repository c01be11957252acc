//! Tool registry and constraint engine, consumed by the feasibility checker.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::Value;

use crate::spec::{RiskTier, Task};

/// What the registry knows about a tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub available: bool,
    pub risk_level: RiskTier,
}

/// Lookup interface for registered tools.
pub trait ToolRegistry: Send + Sync {
    fn get_tool(&self, name: &str) -> Option<ToolInfo>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ToolRegistry) {}
};

/// A fixed in-memory registry, useful as the common case and in tests.
#[derive(Default)]
pub struct StaticToolRegistry {
    tools: HashMap<String, ToolInfo>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolInfo) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn with_tool(mut self, tool: ToolInfo) -> Self {
        self.register(tool);
        self
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn get_tool(&self, name: &str) -> Option<ToolInfo> {
        self.tools.get(name).cloned()
    }
}

/// Outcome of evaluating an external constraint engine against a task.
#[derive(Debug, Clone, Default)]
pub struct ConstraintOutcome {
    /// Violated hard constraints; any entry forces infeasibility.
    pub hard_violations: Vec<String>,
    /// Soft-constraint scores in [0, 1], aggregated multiplicatively into
    /// the confidence.
    pub soft_scores: Vec<f64>,
}

/// External constraint engine evaluated against the current world state.
pub trait ConstraintEngine: Send + Sync {
    fn evaluate(&self, task: &Task, world: &BTreeMap<String, Value>) -> ConstraintOutcome;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ConstraintEngine) {}
};
