//! Plan loading and next-task selection for `taskloop next` and the loop.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::calculator::{NextTask, Progress, next_task, progress};
use crate::core::plan_parser::parse_plan;
use crate::core::types::ExecutionPlan;
use crate::io::config::load_config;
use crate::io::documents::{DocumentStore, FsDocumentStore};
use crate::io::init::TaskloopPaths;

/// Read the index and every `*.md` detail document, then parse.
///
/// A missing index yields an empty plan; a missing details directory yields
/// an index-only plan.
pub fn load_plan(
    documents: &dyn DocumentStore,
    index_path: &Path,
    details_dir: &Path,
) -> Result<ExecutionPlan> {
    let index = match documents.read_document(index_path)? {
        Some(text) => text,
        None => {
            debug!(path = %index_path.display(), "index document missing");
            String::new()
        }
    };

    let mut details = Vec::new();
    match documents.list_documents(details_dir)? {
        Some(names) => {
            for name in names.into_iter().filter(|name| name.ends_with(".md")) {
                // removed between listing and reading
                if let Some(text) = documents.read_document(&details_dir.join(&name))? {
                    details.push((name, text));
                }
            }
        }
        None => debug!(path = %details_dir.display(), "details directory missing"),
    }

    Ok(parse_plan(&index, &details))
}

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Ready {
        task_id: String,
        title: String,
        milestone_id: String,
    },
    Blocked {
        blocked_by: Vec<String>,
    },
    Complete,
    NoPending,
}

pub fn select_next(plan: &ExecutionPlan) -> SelectOutcome {
    match next_task(plan) {
        NextTask::Ready { task, milestone } => SelectOutcome::Ready {
            task_id: task.id.clone(),
            title: task.title.clone(),
            milestone_id: milestone.id.clone(),
        },
        NextTask::Blocked { blocked_by } => SelectOutcome::Blocked { blocked_by },
        NextTask::AllCompleted => SelectOutcome::Complete,
        NextTask::NoPending => SelectOutcome::NoPending,
    }
}

/// Load the plan under `root` (per its config) and select the next task.
pub fn select_from_root(root: &Path) -> Result<(SelectOutcome, Progress)> {
    let plan = plan_from_root(root)?;
    Ok((select_next(&plan), progress(&plan)))
}

pub fn plan_from_root(root: &Path) -> Result<ExecutionPlan> {
    let paths = TaskloopPaths::new(root);
    let config = load_config(&paths.config_path).context("load config.toml")?;
    load_plan(
        &FsDocumentStore,
        &paths.index_path(&config),
        &paths.details_dir(&config),
    )
    .context("load plan for selection")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::TaskStatus;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, text).expect("write");
    }

    #[test]
    fn missing_documents_yield_empty_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_from_root(temp.path()).expect("plan");
        assert_eq!(plan.total_tasks, 0);
        let (outcome, progress) = select_from_root(temp.path()).expect("select");
        assert_eq!(outcome, SelectOutcome::Complete);
        assert_eq!(progress.percent, 0);
    }

    #[test]
    fn missing_details_dir_yields_index_only_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            "docs/plan/TASKS.md",
            "## M1: One\n- [x] 001: First\n- [ ] 002: Second\n",
        );
        let plan = plan_from_root(temp.path()).expect("plan");
        assert_eq!(plan.total_tasks, 2);
        let second = plan.find_task("002").expect("002");
        assert_eq!(second.description, None);
        assert!(second.depends.is_empty());
    }

    #[test]
    fn details_are_merged_and_non_markdown_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            "docs/plan/TASKS.md",
            "## M1: One\n- [ ] 001: First\n- [ ] 002: Second\n",
        );
        write(
            temp.path(),
            "docs/plan/milestones/M1.md",
            "# M1: One\n\n## 002: Second\n\nBuild it.\n\nDepends: 001\n",
        );
        write(
            temp.path(),
            "docs/plan/milestones/notes.txt",
            "## 001: First\n\nDepends: 002\n",
        );

        let plan = plan_from_root(temp.path()).expect("plan");
        assert_eq!(plan.find_task("002").expect("002").depends, vec!["001"]);
        assert!(plan.find_task("001").expect("001").depends.is_empty());

        let (outcome, _) = select_from_root(temp.path()).expect("select");
        assert_eq!(
            outcome,
            SelectOutcome::Ready {
                task_id: "001".to_string(),
                title: "First".to_string(),
                milestone_id: "M1".to_string(),
            }
        );
    }

    #[test]
    fn skipped_dependency_blocks_selection() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            "docs/plan/TASKS.md",
            "## M1: One\n- [~] 001: First\n- [ ] 002: Second\n",
        );
        write(
            temp.path(),
            "docs/plan/milestones/M1.md",
            "## 002: Second\n\nDepends: 001\n",
        );
        let plan = plan_from_root(temp.path()).expect("plan");
        assert_eq!(
            plan.find_task("001").expect("001").status,
            TaskStatus::Skipped
        );
        assert_eq!(
            select_next(&plan),
            SelectOutcome::Blocked {
                blocked_by: vec!["002".to_string()]
            }
        );
    }
}
