//! Minimal unified diffs for tool-initiated writes.
//!
//! Every write/edit observed in a tool result is rendered as a unified
//! diff and embedded in the reported event, feeding audit, replay, and the
//! merge coordinator.

use similar::TextDiff;

use crate::domain::ports::FileChange;

/// Render a minimal unified diff with 3 lines of context.
pub fn unified_diff(change: &FileChange) -> String {
    TextDiff::from_lines(&change.before, &change.after)
        .unified_diff()
        .context_radius(3)
        .header(
            &format!("a/{}", change.path),
            &format!("b/{}", change.path),
        )
        .to_string()
}

/// Whether the change actually modifies the file.
pub fn is_noop(change: &FileChange) -> bool {
    change.before == change.after
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_shows_changed_lines() {
        let change = FileChange {
            path: "src/lib.rs".to_string(),
            before: "fn main() {\n    println!(\"old\");\n}\n".to_string(),
            after: "fn main() {\n    println!(\"new\");\n}\n".to_string(),
        };
        let diff = unified_diff(&change);
        assert!(diff.contains("a/src/lib.rs"));
        assert!(diff.contains("b/src/lib.rs"));
        assert!(diff.contains("-    println!(\"old\");"));
        assert!(diff.contains("+    println!(\"new\");"));
    }

    #[test]
    fn test_noop_detection() {
        let same = FileChange {
            path: "x".to_string(),
            before: "abc\n".to_string(),
            after: "abc\n".to_string(),
        };
        assert!(is_noop(&same));

        let changed = FileChange {
            after: "abd\n".to_string(),
            ..same
        };
        assert!(!is_noop(&changed));
    }

    #[test]
    fn test_new_file_diff() {
        let change = FileChange {
            path: "new.rs".to_string(),
            before: String::new(),
            after: "line one\nline two\n".to_string(),
        };
        let diff = unified_diff(&change);
        assert!(diff.contains("+line one"));
        assert!(diff.contains("+line two"));
    }
}
