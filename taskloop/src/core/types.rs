//! Shared deterministic types for the plan model.
//!
//! An [`ExecutionPlan`] is a transient projection of the plan documents. It is
//! rebuilt from markdown on every orchestration step and never persisted.

use serde::{Deserialize, Serialize};

/// Scheduling status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// Smallest unit of agent-executed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub verification: Option<String>,
    pub status: TaskStatus,
    pub milestone_id: String,
    pub depends: Vec<String>,
}

/// Named grouping of tasks. Counts are derived from `tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    pub completed_count: usize,
    pub total_count: usize,
}

impl Milestone {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            tasks: Vec::new(),
            completed_count: 0,
            total_count: 0,
        }
    }

    /// Recompute `completed_count` and `total_count` from the task list.
    pub fn refresh_counts(&mut self) {
        self.total_count = self.tasks.len();
        self.completed_count = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .count();
    }
}

/// Milestones in document order, with derived totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub milestones: Vec<Milestone>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
}

impl ExecutionPlan {
    pub fn new(milestones: Vec<Milestone>) -> Self {
        let mut plan = Self {
            milestones,
            total_tasks: 0,
            completed_tasks: 0,
        };
        plan.refresh_counts();
        plan
    }

    pub fn refresh_counts(&mut self) {
        for milestone in &mut self.milestones {
            milestone.refresh_counts();
        }
        self.total_tasks = self.milestones.iter().map(|m| m.total_count).sum();
        self.completed_tasks = self.milestones.iter().map(|m| m.completed_count).sum();
    }

    /// Iterate tasks in plan order (milestone order, then task order).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.milestones.iter().flat_map(|m| m.tasks.iter())
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks().find(|task| task.id == task_id)
    }

    pub fn find_milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == milestone_id)
    }

    /// Overwrite one task's status in memory (e.g. to mark the in-flight task running).
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) -> bool {
        let mut found = false;
        for milestone in &mut self.milestones {
            for task in &mut milestone.tasks {
                if task.id == task_id {
                    task.status = status;
                    found = true;
                }
            }
        }
        if found {
            self.refresh_counts();
        }
        found
    }
}
