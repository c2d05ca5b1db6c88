//! Continuous-mode iteration state.
//!
//! In continuous mode the worker re-prompts the agent until the completion
//! signal is observed `completion_threshold` times in a row and the
//! working tree validates clean, or until run/budget/time limits stop the
//! loop. Notes left in the notes file are folded into each re-prompt.

use std::path::Path;

use tokio::process::Command;

use crate::domain::errors::DomainResult;

/// Iteration accounting for continuous mode.
#[derive(Debug, Clone)]
pub struct ContinuousState {
    completion_signal: String,
    completion_threshold: u32,
    max_runs: u32,
    pub runs: u32,
    pub consecutive_signals: u32,
}

impl ContinuousState {
    pub fn new(completion_signal: impl Into<String>, completion_threshold: u32, max_runs: u32) -> Self {
        Self {
            completion_signal: completion_signal.into(),
            completion_threshold: completion_threshold.max(1),
            max_runs,
            runs: 0,
            consecutive_signals: 0,
        }
    }

    /// Record one finished iteration and whether its output carried the
    /// completion signal.
    pub fn record_run(&mut self, output: &str) {
        self.runs += 1;
        if output.contains(&self.completion_signal) {
            self.consecutive_signals += 1;
        } else {
            self.consecutive_signals = 0;
        }
    }

    /// An iteration that signalled completion but failed validation does
    /// not count toward the threshold.
    pub fn invalidate_signal(&mut self) {
        self.consecutive_signals = 0;
    }

    /// Enough consecutive completion signals to stop.
    pub fn is_complete(&self) -> bool {
        self.consecutive_signals >= self.completion_threshold
    }

    /// Run cap reached.
    pub fn runs_exhausted(&self) -> bool {
        self.runs >= self.max_runs
    }
}

/// Working-tree state relevant to the completion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitTreeState {
    pub is_repo: bool,
    pub dirty_files: Vec<String>,
}

impl GitTreeState {
    pub fn is_clean(&self) -> bool {
        !self.is_repo || self.dirty_files.is_empty()
    }
}

/// Inspect the working tree. A dirty tree with no commit means the
/// iteration is not truly complete.
pub async fn git_tree_state(workdir: &Path) -> DomainResult<GitTreeState> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workdir)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let dirty_files = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.trim_start_matches(['M', 'A', 'D', 'R', '?', ' ']).trim().to_string())
                .collect();
            Ok(GitTreeState {
                is_repo: true,
                dirty_files,
            })
        }
        // Not a git repo (or git missing): nothing to validate.
        _ => Ok(GitTreeState {
            is_repo: false,
            dirty_files: Vec::new(),
        }),
    }
}

/// Check out the configured branch during worker boot. Creates the
/// branch from the current HEAD when it does not exist yet. A missing
/// repository is not an error; the agent may be bootstrapping one.
pub async fn checkout_branch(workdir: &Path, branch: &str) -> DomainResult<bool> {
    let checkout = Command::new("git")
        .args(["checkout", branch])
        .current_dir(workdir)
        .output()
        .await;
    match checkout {
        Ok(output) if output.status.success() => Ok(true),
        Ok(_) => {
            let create = Command::new("git")
                .args(["checkout", "-b", branch])
                .current_dir(workdir)
                .output()
                .await;
            Ok(matches!(create, Ok(output) if output.status.success()))
        }
        Err(_) => Ok(false),
    }
}

/// Read the notes file the agent maintains between iterations.
pub async fn read_notes(workdir: &Path, notes_file: &str) -> Option<String> {
    let path = workdir.join(notes_file);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) if !contents.trim().is_empty() => Some(contents),
        _ => None,
    }
}

/// Build the continuation prompt for the next iteration.
pub fn continuation_prompt(
    iteration: u32,
    notes: Option<&str>,
    tree: &GitTreeState,
    completion_signal: &str,
) -> String {
    let mut prompt = format!(
        "Continue working on the task (iteration {iteration}). \
         When the task is fully complete — code committed, tests passing — \
         respond with the exact phrase {completion_signal}."
    );
    if !tree.is_clean() {
        prompt.push_str(&format!(
            "\n\nThe working tree has {} uncommitted change(s); commit or revert them before \
             declaring completion.",
            tree.dirty_files.len()
        ));
    }
    if let Some(notes) = notes {
        prompt.push_str("\n\nNotes from previous iterations:\n");
        prompt.push_str(notes);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_requires_consecutive_signals() {
        let mut state = ContinuousState::new("TASK_COMPLETE", 2, 10);

        state.record_run("still working");
        assert!(!state.is_complete());

        state.record_run("done: TASK_COMPLETE");
        assert!(!state.is_complete());

        state.record_run("confirming TASK_COMPLETE");
        assert!(state.is_complete());
    }

    #[test]
    fn test_signal_streak_resets() {
        let mut state = ContinuousState::new("TASK_COMPLETE", 2, 10);
        state.record_run("TASK_COMPLETE");
        state.record_run("actually, one more thing");
        state.record_run("TASK_COMPLETE");
        assert!(!state.is_complete());
    }

    #[test]
    fn test_validation_failure_invalidates_signal() {
        let mut state = ContinuousState::new("TASK_COMPLETE", 1, 10);
        state.record_run("TASK_COMPLETE");
        assert!(state.is_complete());
        state.invalidate_signal();
        assert!(!state.is_complete());
    }

    #[test]
    fn test_run_cap() {
        let mut state = ContinuousState::new("X", 2, 2);
        state.record_run("a");
        assert!(!state.runs_exhausted());
        state.record_run("b");
        assert!(state.runs_exhausted());
    }

    #[test]
    fn test_continuation_prompt_mentions_dirty_tree_and_notes() {
        let tree = GitTreeState {
            is_repo: true,
            dirty_files: vec!["src/lib.rs".to_string()],
        };
        let prompt = continuation_prompt(3, Some("remember the edge case"), &tree, "DONE");
        assert!(prompt.contains("iteration 3"));
        assert!(prompt.contains("1 uncommitted change"));
        assert!(prompt.contains("remember the edge case"));
        assert!(prompt.contains("DONE"));

        let clean = GitTreeState {
            is_repo: true,
            dirty_files: Vec::new(),
        };
        let prompt = continuation_prompt(1, None, &clean, "DONE");
        assert!(!prompt.contains("uncommitted"));
    }
}
