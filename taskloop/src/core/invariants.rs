//! Structural invariants of a parsed plan.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::core::types::ExecutionPlan;

/// A structural problem that makes a plan unsafe to execute.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanDefect {
    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle involving task '{0}'")]
    Cycle(String),
}

/// Check plan invariants:
/// - Task ids are unique across all milestones
/// - Every dependency names a task in the plan
/// - No task depends on itself
/// - The dependency graph is acyclic
pub fn validate_plan(plan: &ExecutionPlan) -> Vec<PlanDefect> {
    let mut defects = Vec::new();

    let mut seen = HashSet::new();
    for task in plan.tasks() {
        if !seen.insert(task.id.as_str()) {
            defects.push(PlanDefect::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in plan.tasks() {
        for dep in &task.depends {
            if dep == &task.id {
                defects.push(PlanDefect::SelfDependency(task.id.clone()));
            } else if !seen.contains(dep.as_str()) {
                defects.push(PlanDefect::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(node) = find_cycle(plan) {
        defects.push(PlanDefect::Cycle(node));
    }

    defects
}

/// Depth-first search over dependency edges. Self-edges are reported separately.
fn find_cycle(plan: &ExecutionPlan) -> Option<String> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in plan.tasks() {
        adj.entry(task.id.as_str()).or_default();
        for dep in &task.depends {
            if dep != &task.id {
                adj.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }
    }

    fn dfs<'a>(
        node: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        visited.insert(node);
        on_stack.insert(node);
        if let Some(next) = adj.get(node) {
            for &neighbor in next {
                if !visited.contains(neighbor) {
                    if let Some(hit) = dfs(neighbor, adj, visited, on_stack) {
                        return Some(hit);
                    }
                } else if on_stack.contains(neighbor) {
                    return Some(neighbor);
                }
            }
        }
        on_stack.remove(node);
        None
    }

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    for task in plan.tasks() {
        if visited.contains(task.id.as_str()) {
            continue;
        }
        if let Some(hit) = dfs(task.id.as_str(), &adj, &mut visited, &mut on_stack) {
            return Some(hit.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{milestone, plan, task};

    #[test]
    fn well_formed_plan_has_no_defects() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("1", TaskStatus::Pending, &[]),
                task("2", TaskStatus::Pending, &["1"]),
            ],
        )]);
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn duplicate_ids_across_milestones_are_reported() {
        let plan = plan(vec![
            milestone("M1", vec![task("1", TaskStatus::Pending, &[])]),
            milestone("M2", vec![task("1", TaskStatus::Pending, &[])]),
        ]);
        assert_eq!(
            validate_plan(&plan),
            vec![PlanDefect::DuplicateTaskId("1".to_string())]
        );
    }

    #[test]
    fn unknown_and_self_dependencies_are_reported() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("1", TaskStatus::Pending, &["1"]),
                task("2", TaskStatus::Pending, &["ghost"]),
            ],
        )]);
        let defects = validate_plan(&plan);
        assert!(defects.contains(&PlanDefect::SelfDependency("1".to_string())));
        assert!(defects.contains(&PlanDefect::UnknownDependency {
            task: "2".to_string(),
            dependency: "ghost".to_string(),
        }));
        assert!(!defects.iter().any(|d| matches!(d, PlanDefect::Cycle(_))));
    }

    #[test]
    fn cycles_are_detected() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("a", TaskStatus::Pending, &["c"]),
                task("b", TaskStatus::Pending, &["a"]),
                task("c", TaskStatus::Pending, &["b"]),
            ],
        )]);
        let defects = validate_plan(&plan);
        assert_eq!(defects.len(), 1);
        assert!(matches!(defects[0], PlanDefect::Cycle(_)));
    }
}
