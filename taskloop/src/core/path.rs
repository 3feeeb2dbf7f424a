//! Safety checks for agent-supplied relative paths.
//!
//! Agent output is untrusted: every path must stay inside the project root
//! without relying on the filesystem to resolve it.

/// Return every reason `path` is unsafe to write under the project root.
pub fn validate_path(path: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if path.trim().is_empty() {
        errors.push("path is empty".to_string());
        return errors;
    }

    if path.chars().any(char::is_control) {
        errors.push(format!("{path:?}: path contains control characters"));
    }

    if is_absolute(path) {
        errors.push(format!("{path}: absolute paths are not allowed"));
    }

    let segments: Vec<&str> = path.split(['/', '\\']).collect();
    if segments.iter().any(|segment| *segment == "..") {
        errors.push(format!("{path}: parent-directory segments are not allowed"));
    }
    if segments.iter().any(|segment| *segment == ".git") {
        errors.push(format!("{path}: writes inside .git are not allowed"));
    }
    if segments.iter().all(|segment| segment.is_empty() || *segment == ".") {
        errors.push(format!("{path}: path does not name a file"));
    }

    errors
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') || path.starts_with('~') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
