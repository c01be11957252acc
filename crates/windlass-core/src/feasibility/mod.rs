//! Pre-execution feasibility check.
//!
//! A pure function of (task, tool registry, constraint engine, world state).
//! Hard failures (missing tool, risk above tier, null inputs, hard
//! constraint violations) force infeasibility; soft-constraint scores
//! aggregate multiplicatively into the confidence score.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::adapters::{ConstraintEngine, ToolRegistry};
use crate::error::TaskFailure;
use crate::spec::{RiskTier, Task};

/// The structured cause of an infeasible verdict, when one single check is
/// to blame.
#[derive(Debug, Clone, PartialEq)]
pub enum Blocker {
    ToolUnavailable { tool: String },
    RiskExceedsTier { tool: String, tool_risk: RiskTier },
    ToolNotAllowed { tool: String },
    NullInput { key: String },
    HardConstraint { constraint: String },
}

/// The checker's verdict.
#[derive(Debug, Clone)]
pub struct FeasibilityReport {
    pub feasible: bool,
    pub reasons: Vec<String>,
    /// Confidence in [0, 1]; 1.0 when nothing argued against the task.
    pub confidence_score: f64,
    /// First hard blocker encountered, if any.
    pub blocker: Option<Blocker>,
}

impl FeasibilityReport {
    fn feasible(confidence_score: f64, reasons: Vec<String>) -> Self {
        Self {
            feasible: true,
            reasons,
            confidence_score,
            blocker: None,
        }
    }

    fn infeasible(blocker: Blocker, reasons: Vec<String>) -> Self {
        Self {
            feasible: false,
            reasons,
            confidence_score: 0.0,
            blocker: Some(blocker),
        }
    }

    /// Map an infeasible report to the task failure it implies.
    pub fn into_failure(self, task: &Task) -> TaskFailure {
        match self.blocker {
            Some(Blocker::ToolUnavailable { tool }) => TaskFailure::ToolUnavailable { tool },
            Some(Blocker::RiskExceedsTier { tool, tool_risk }) => TaskFailure::RiskExceedsTier {
                tool,
                tool_risk,
                task_tier: task.risk_tier,
            },
            _ => TaskFailure::FeasibilityFailed {
                reasons: self.reasons,
            },
        }
    }
}

/// Run the feasibility check.
///
/// A task with no `tool` passes trivially (subject to input and constraint
/// checks). `world` is the current world-state values keyed by world key.
pub fn check(
    task: &Task,
    registry: Option<&dyn ToolRegistry>,
    constraints: Option<&dyn ConstraintEngine>,
    world: &BTreeMap<String, Value>,
) -> FeasibilityReport {
    let mut reasons = Vec::new();
    let mut confidence = 1.0f64;

    // Null or missing input values are never executable.
    for (key, value) in &task.inputs {
        if value.is_null() {
            reasons.push(format!("input {key:?} is null"));
            return FeasibilityReport::infeasible(Blocker::NullInput { key: key.clone() }, reasons);
        }
    }

    if let Some(tool_name) = task.tool.as_deref() {
        // Tool whitelist applies whether or not a registry is configured.
        if let Some(allowed) = &task.allowed_tools {
            if !allowed.iter().any(|t| t == tool_name) {
                reasons.push(format!("tool {tool_name:?} is not in the task's allowed list"));
                return FeasibilityReport::infeasible(
                    Blocker::ToolNotAllowed {
                        tool: tool_name.to_owned(),
                    },
                    reasons,
                );
            }
        }

        if let Some(registry) = registry {
            let Some(info) = registry.get_tool(tool_name) else {
                reasons.push(format!("tool {tool_name:?} is not registered"));
                return FeasibilityReport::infeasible(
                    Blocker::ToolUnavailable {
                        tool: tool_name.to_owned(),
                    },
                    reasons,
                );
            };
            if !info.available {
                reasons.push(format!("tool {tool_name:?} is registered but unavailable"));
                return FeasibilityReport::infeasible(
                    Blocker::ToolUnavailable {
                        tool: tool_name.to_owned(),
                    },
                    reasons,
                );
            }
            if info.risk_level > task.risk_tier {
                reasons.push(format!(
                    "tool {tool_name:?} risk {} exceeds task tier {}",
                    info.risk_level, task.risk_tier
                ));
                return FeasibilityReport::infeasible(
                    Blocker::RiskExceedsTier {
                        tool: tool_name.to_owned(),
                        tool_risk: info.risk_level,
                    },
                    reasons,
                );
            }
        }
    }

    if let Some(engine) = constraints {
        let outcome = engine.evaluate(task, world);
        if let Some(violation) = outcome.hard_violations.first() {
            for v in &outcome.hard_violations {
                reasons.push(format!("hard constraint violated: {v}"));
            }
            return FeasibilityReport::infeasible(
                Blocker::HardConstraint {
                    constraint: violation.clone(),
                },
                reasons,
            );
        }
        for score in outcome.soft_scores {
            confidence *= score.clamp(0.0, 1.0);
        }
    }

    FeasibilityReport::feasible(confidence, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ConstraintOutcome, StaticToolRegistry, ToolInfo};
    use crate::spec::RiskTier;
    use serde_json::json;

    fn registry_with(name: &str, available: bool, risk: RiskTier) -> StaticToolRegistry {
        StaticToolRegistry::new().with_tool(ToolInfo {
            name: name.into(),
            capabilities: vec![],
            available,
            risk_level: risk,
        })
    }

    struct FixedConstraints(ConstraintOutcome);

    impl ConstraintEngine for FixedConstraints {
        fn evaluate(&self, _task: &Task, _world: &BTreeMap<String, Value>) -> ConstraintOutcome {
            self.0.clone()
        }
    }

    #[test]
    fn tool_less_task_passes_trivially() {
        let task = Task::new("t", "no tool");
        let report = check(&task, None, None, &BTreeMap::new());
        assert!(report.feasible);
        assert_eq!(report.confidence_score, 1.0);
    }

    #[test]
    fn unregistered_tool_is_infeasible() {
        let task = Task::new("t", "tooling").with_tool("shell");
        let registry = StaticToolRegistry::new();
        let report = check(&task, Some(&registry), None, &BTreeMap::new());
        assert!(!report.feasible);
        assert!(matches!(report.blocker, Some(Blocker::ToolUnavailable { .. })));
    }

    #[test]
    fn unavailable_tool_is_infeasible() {
        let task = Task::new("t", "tooling").with_tool("shell");
        let registry = registry_with("shell", false, RiskTier::Low);
        let report = check(&task, Some(&registry), None, &BTreeMap::new());
        assert!(!report.feasible);
    }

    #[test]
    fn risk_above_tier_is_infeasible() {
        let task = Task::new("t", "risky")
            .with_tool("shell")
            .with_risk_tier(RiskTier::Low);
        let registry = registry_with("shell", true, RiskTier::High);
        let report = check(&task, Some(&registry), None, &BTreeMap::new());
        assert!(!report.feasible);
        assert!(matches!(report.blocker, Some(Blocker::RiskExceedsTier { .. })));
    }

    #[test]
    fn risk_at_tier_is_fine() {
        let task = Task::new("t", "risky")
            .with_tool("shell")
            .with_risk_tier(RiskTier::High);
        let registry = registry_with("shell", true, RiskTier::High);
        assert!(check(&task, Some(&registry), None, &BTreeMap::new()).feasible);
    }

    #[test]
    fn whitelist_blocks_other_tools() {
        let task = Task::new("t", "strict")
            .with_tool("shell")
            .with_allowed_tools(vec!["browser".into()]);
        let report = check(&task, None, None, &BTreeMap::new());
        assert!(!report.feasible);
        assert!(matches!(report.blocker, Some(Blocker::ToolNotAllowed { .. })));
    }

    #[test]
    fn null_input_is_infeasible() {
        let task = Task::new("t", "nullish").with_input("target", Value::Null);
        let report = check(&task, None, None, &BTreeMap::new());
        assert!(!report.feasible);
        assert!(matches!(report.blocker, Some(Blocker::NullInput { .. })));
    }

    #[test]
    fn hard_constraint_violation_is_infeasible() {
        let task = Task::new("t", "constrained");
        let engine = FixedConstraints(ConstraintOutcome {
            hard_violations: vec!["budget_exhausted".into()],
            soft_scores: vec![],
        });
        let report = check(&task, None, Some(&engine), &BTreeMap::new());
        assert!(!report.feasible);
        assert!(report.reasons[0].contains("budget_exhausted"));
    }

    #[test]
    fn soft_scores_multiply_into_confidence() {
        let task = Task::new("t", "soft");
        let engine = FixedConstraints(ConstraintOutcome {
            hard_violations: vec![],
            soft_scores: vec![0.5, 0.5],
        });
        let report = check(&task, None, Some(&engine), &BTreeMap::new());
        assert!(report.feasible);
        assert!((report.confidence_score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn non_null_inputs_pass() {
        let task = Task::new("t", "inputs").with_input("target", json!("db-1"));
        assert!(check(&task, None, None, &BTreeMap::new()).feasible);
    }
}
