//! Workflow spec validation.
//!
//! Checks, before anything executes:
//! - Workflow and task ids are non-empty, task ids unique.
//! - Retry policies are within bounds (`max_attempts >= 1`).
//! - Dependency references point to existing task ids.
//! - The dependency graph is acyclic (topological sort).

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::WorkflowSpec;

/// Errors that can occur during spec validation.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid workflow spec: {0}")]
    SchemaInvalid(String),

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownTaskDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Validate a workflow spec.
pub fn validate(spec: &WorkflowSpec) -> Result<(), SpecError> {
    if spec.id.is_empty() {
        return Err(SpecError::SchemaInvalid("workflow id is empty".into()));
    }
    if spec.name.is_empty() {
        return Err(SpecError::SchemaInvalid("workflow name is empty".into()));
    }
    if spec.tasks.is_empty() {
        return Err(SpecError::SchemaInvalid(
            "workflow must contain at least one task".into(),
        ));
    }

    // Collect task ids and check for duplicates.
    let mut seen = HashSet::new();
    for task in &spec.tasks {
        if task.id.is_empty() {
            return Err(SpecError::SchemaInvalid("task id is empty".into()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(SpecError::DuplicateTaskId(task.id.clone()));
        }
        if task.retry.max_attempts < 1 {
            return Err(SpecError::SchemaInvalid(format!(
                "task {:?} has retry.max_attempts = 0 (must be >= 1)",
                task.id
            )));
        }
        if task.retry.backoff_multiplier < 0.0 {
            return Err(SpecError::SchemaInvalid(format!(
                "task {:?} has a negative backoff multiplier",
                task.id
            )));
        }
    }

    // Check dependency references, both the map keys and their entries.
    for (task_id, prerequisites) in &spec.dependencies {
        if !seen.contains(task_id.as_str()) {
            return Err(SpecError::UnknownTaskDependency {
                task: task_id.clone(),
                dependency: task_id.clone(),
            });
        }
        for dep in prerequisites {
            if !seen.contains(dep.as_str()) {
                return Err(SpecError::UnknownTaskDependency {
                    task: task_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(spec)
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
///
/// Returns `Ok(())` if the graph is a DAG, or `Err` naming the tasks left
/// inside a cycle.
fn check_for_cycles(spec: &WorkflowSpec) -> Result<(), SpecError> {
    let task_ids: Vec<&str> = spec.tasks.iter().map(|t| t.id.as_str()).collect();
    let id_to_idx: HashMap<&str, usize> = task_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    let n = task_ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in &spec.tasks {
        let task_idx = id_to_idx[task.id.as_str()];
        for dep_id in spec.prerequisites(&task.id) {
            let dep_idx = id_to_idx[dep_id.as_str()];
            // Edge: dep -> task (dep must complete before task).
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_tasks: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| task_ids[i])
            .collect();
        return Err(SpecError::CycleDetected(cycle_tasks.join(", ")));
    }

    Ok(())
}
