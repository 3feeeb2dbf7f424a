//! Checkbox rewriting for the task index document.

use thiserror::Error;

use crate::core::plan_parser::parse_index_task_line;
use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkStatusError {
    #[error("task '{0}' not found in index document")]
    TaskNotFound(String),

    #[error("status '{}' cannot be written to the index document", .0.as_str())]
    UnsupportedStatus(TaskStatus),
}

/// Checkbox mark written for `status`. Only operator-visible resting states
/// are written; running and failed live in the execution store.
pub fn mark_for_status(status: TaskStatus) -> Option<char> {
    match status {
        TaskStatus::Pending => Some(' '),
        TaskStatus::Completed => Some('x'),
        TaskStatus::Skipped => Some('~'),
        TaskStatus::Running | TaskStatus::Failed => None,
    }
}

/// Rewrite the checkbox of every index line for `task_id`, leaving all other
/// bytes (including line endings) untouched.
pub fn mark_task_status(
    index: &str,
    task_id: &str,
    status: TaskStatus,
) -> Result<String, MarkStatusError> {
    let mark = mark_for_status(status).ok_or(MarkStatusError::UnsupportedStatus(status))?;

    let mut out = String::with_capacity(index.len());
    let mut found = false;
    for line in index.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let is_target = parse_index_task_line(body).is_some_and(|parsed| parsed.id == task_id);
        match line.find('[') {
            Some(open) if is_target => {
                found = true;
                out.push_str(&line[..=open]);
                out.push(mark);
                // the mark is a single ASCII byte
                out.push_str(&line[open + 2..]);
            }
            _ => out.push_str(line),
        }
    }

    if !found {
        return Err(MarkStatusError::TaskNotFound(task_id.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = "# Tasks\n\n## M1: Foundation\n- [ ] 001: Set up project\n- [ ] 002: Add parser [core]\n\nNotes stay put.\n";

    #[test]
    fn marks_only_the_matching_line() {
        let updated = mark_task_status(INDEX, "002", TaskStatus::Completed).expect("mark");
        assert_eq!(
            updated,
            "# Tasks\n\n## M1: Foundation\n- [ ] 001: Set up project\n- [x] 002: Add parser [core]\n\nNotes stay put.\n"
        );
    }

    #[test]
    fn skip_and_reset_round_trip() {
        let skipped = mark_task_status(INDEX, "001", TaskStatus::Skipped).expect("skip");
        assert!(skipped.contains("- [~] 001: Set up project"));
        let reset = mark_task_status(&skipped, "001", TaskStatus::Pending).expect("reset");
        assert_eq!(reset, INDEX);
    }

    #[test]
    fn preserves_crlf_and_missing_trailing_newline() {
        let index = "## M1: A\r\n- [ ] 1: First\r\n- [ ] 2: Second";
        let updated = mark_task_status(index, "2", TaskStatus::Completed).expect("mark");
        assert_eq!(updated, "## M1: A\r\n- [ ] 1: First\r\n- [x] 2: Second");
    }

    #[test]
    fn id_prefix_does_not_match() {
        let index = "- [ ] 10: Ten\n- [ ] 1: One\n";
        let updated = mark_task_status(index, "1", TaskStatus::Completed).expect("mark");
        assert_eq!(updated, "- [ ] 10: Ten\n- [x] 1: One\n");
    }

    #[test]
    fn errors_on_unknown_task_or_unwritable_status() {
        assert_eq!(
            mark_task_status(INDEX, "999", TaskStatus::Completed),
            Err(MarkStatusError::TaskNotFound("999".to_string()))
        );
        assert_eq!(
            mark_task_status(INDEX, "001", TaskStatus::Failed),
            Err(MarkStatusError::UnsupportedStatus(TaskStatus::Failed))
        );
    }
}
