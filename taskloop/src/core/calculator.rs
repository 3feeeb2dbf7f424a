//! Deterministic task selection over an [`ExecutionPlan`].
//!
//! Selection is positional: milestone order, then task order. A task is
//! selectable when it is pending and every dependency is `completed`. A skipped
//! dependency does not satisfy its dependents, so skipping blocks everything
//! downstream until an operator resolves it.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::types::{ExecutionPlan, Milestone, Task, TaskStatus};

/// Result of asking the plan for the next unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTask<'a> {
    /// First selectable task in plan order.
    Ready {
        task: &'a Task,
        milestone: &'a Milestone,
    },
    /// Pending tasks exist but none has all dependencies completed.
    Blocked { blocked_by: Vec<String> },
    /// Every task is completed or skipped (also returned for an empty plan).
    AllCompleted,
    /// Nothing is pending, but some task is still running or failed.
    NoPending,
}

impl NextTask<'_> {
    pub fn reason(&self) -> &'static str {
        match self {
            NextTask::Ready { .. } => "ready",
            NextTask::Blocked { .. } => "blocked",
            NextTask::AllCompleted => "all_completed",
            NextTask::NoPending => "no_pending",
        }
    }
}

/// Plan completion summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}

/// Select the next executable task.
pub fn next_task(plan: &ExecutionPlan) -> NextTask<'_> {
    let statuses: HashMap<&str, TaskStatus> = plan
        .tasks()
        .map(|task| (task.id.as_str(), task.status))
        .collect();

    let mut blocked_by = Vec::new();
    for milestone in &plan.milestones {
        for task in &milestone.tasks {
            if task.status != TaskStatus::Pending {
                continue;
            }
            if dependencies_satisfied(task, &statuses) {
                return NextTask::Ready { task, milestone };
            }
            blocked_by.push(task.id.clone());
        }
    }

    if !blocked_by.is_empty() {
        return NextTask::Blocked { blocked_by };
    }

    let unfinished = plan
        .tasks()
        .any(|task| matches!(task.status, TaskStatus::Running | TaskStatus::Failed));
    if unfinished {
        NextTask::NoPending
    } else {
        NextTask::AllCompleted
    }
}

/// True if every dependency of `task` is `completed`. Unknown ids never satisfy.
pub fn dependencies_satisfied(task: &Task, statuses: &HashMap<&str, TaskStatus>) -> bool {
    task.depends
        .iter()
        .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Completed))
}

/// Ids of pending tasks with at least one unsatisfied dependency, in plan order.
pub fn blocked_tasks(plan: &ExecutionPlan) -> Vec<String> {
    let statuses: HashMap<&str, TaskStatus> = plan
        .tasks()
        .map(|task| (task.id.as_str(), task.status))
        .collect();
    plan.tasks()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| !dependencies_satisfied(task, &statuses))
        .map(|task| task.id.clone())
        .collect()
}

/// Completed/total counts and the rounded percentage (0 for an empty plan).
pub fn progress(plan: &ExecutionPlan) -> Progress {
    let total = plan.tasks().count();
    let completed = plan
        .tasks()
        .filter(|task| task.status == TaskStatus::Completed)
        .count();
    let percent = if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as u8
    };
    Progress {
        completed,
        total,
        percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{milestone, plan, task};

    fn selected_id(plan: &ExecutionPlan) -> Option<String> {
        match next_task(plan) {
            NextTask::Ready { task, .. } => Some(task.id.clone()),
            _ => None,
        }
    }

    #[test]
    fn happy_path_walks_dependencies_in_order() {
        let mut plan = plan(vec![milestone(
            "M1",
            vec![
                task("001", TaskStatus::Pending, &[]),
                task("002", TaskStatus::Pending, &["001"]),
            ],
        )]);

        assert_eq!(selected_id(&plan).as_deref(), Some("001"));
        plan.set_status("001", TaskStatus::Completed);
        assert_eq!(selected_id(&plan).as_deref(), Some("002"));
        plan.set_status("002", TaskStatus::Completed);
        assert_eq!(next_task(&plan), NextTask::AllCompleted);
    }

    #[test]
    fn skipped_dependency_blocks_dependents() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("001", TaskStatus::Skipped, &[]),
                task("002", TaskStatus::Pending, &["001"]),
            ],
        )]);

        assert_eq!(
            next_task(&plan),
            NextTask::Blocked {
                blocked_by: vec!["002".to_string()]
            }
        );
    }

    #[test]
    fn skip_blockage_propagates_transitively() {
        let plan = plan(vec![
            milestone(
                "M1",
                vec![
                    task("a", TaskStatus::Skipped, &[]),
                    task("b", TaskStatus::Pending, &["a"]),
                ],
            ),
            milestone("M2", vec![task("c", TaskStatus::Pending, &["b"])]),
        ]);

        assert_eq!(
            next_task(&plan),
            NextTask::Blocked {
                blocked_by: vec!["b".to_string(), "c".to_string()]
            }
        );
        assert_eq!(blocked_tasks(&plan), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn selection_skips_blocked_task_for_later_ready_one() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("001", TaskStatus::Pending, &["003"]),
                task("002", TaskStatus::Pending, &[]),
                task("003", TaskStatus::Pending, &[]),
            ],
        )]);
        assert_eq!(selected_id(&plan).as_deref(), Some("002"));
    }

    #[test]
    fn unknown_dependency_never_satisfies() {
        let plan = plan(vec![milestone(
            "M1",
            vec![task("001", TaskStatus::Pending, &["missing"])],
        )]);
        assert_eq!(
            next_task(&plan),
            NextTask::Blocked {
                blocked_by: vec!["001".to_string()]
            }
        );
    }

    #[test]
    fn completion_detection_holds_for_any_milestone_count() {
        assert_eq!(next_task(&ExecutionPlan::default()), NextTask::AllCompleted);
        assert_eq!(
            next_task(&plan(vec![milestone("M1", Vec::new())])),
            NextTask::AllCompleted
        );

        let plan = plan(vec![
            milestone("M1", vec![task("1", TaskStatus::Completed, &[])]),
            milestone("M2", vec![task("2", TaskStatus::Completed, &["1"])]),
            milestone("M3", vec![task("3", TaskStatus::Skipped, &[])]),
        ]);
        for _ in 0..3 {
            assert_eq!(next_task(&plan), NextTask::AllCompleted);
        }
    }

    #[test]
    fn running_or_failed_without_pending_is_no_pending() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("1", TaskStatus::Completed, &[]),
                task("2", TaskStatus::Running, &[]),
            ],
        )]);
        assert_eq!(next_task(&plan), NextTask::NoPending);
        assert_eq!(next_task(&plan).reason(), "no_pending");
    }

    #[test]
    fn progress_rounds_percent() {
        let plan = plan(vec![milestone(
            "M1",
            vec![
                task("1", TaskStatus::Completed, &[]),
                task("2", TaskStatus::Pending, &[]),
                task("3", TaskStatus::Skipped, &[]),
            ],
        )]);
        assert_eq!(
            progress(&plan),
            Progress {
                completed: 1,
                total: 3,
                percent: 33
            }
        );
        assert_eq!(progress(&ExecutionPlan::default()).percent, 0);
    }

    /// Selected tasks never have an unsatisfied dependency, whatever the status mix.
    #[test]
    fn selection_never_returns_unsatisfied_task() {
        let statuses = [
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Skipped,
            TaskStatus::Failed,
        ];
        for a in statuses {
            for b in statuses {
                for c in statuses {
                    let plan = plan(vec![milestone(
                        "M1",
                        vec![
                            task("a", a, &[]),
                            task("b", b, &["a"]),
                            task("c", c, &["a", "b"]),
                        ],
                    )]);
                    if let NextTask::Ready { task, .. } = next_task(&plan) {
                        for dep in &task.depends {
                            let dep_status = plan.find_task(dep).map(|t| t.status);
                            assert_eq!(dep_status, Some(TaskStatus::Completed));
                        }
                    }
                }
            }
        }
    }
}
