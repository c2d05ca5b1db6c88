//! Convergence merges for parallel sibling tasks.
//!
//! When every sibling of a parent task succeeds, their branches converge
//! onto the target branch: a conflict-score dry run per branch, ascending
//! order (ties by task id), sequential apply, and bounded LLM-assisted
//! conflict resolution. An unresolvable conflict fails the merge and
//! preserves the partial state for manual resolution; everything is
//! audited as a `MergeAttempt`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EntityType, EventEnvelope, MergeAttempt, MergeStatus};
use crate::domain::ports::MergeRepository;
use crate::services::event_bus::EventBus;

/// Outcome of applying one branch.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub merged: bool,
    pub conflict_files: Vec<String>,
    pub commit_sha: Option<String>,
}

/// Git-level operations the coordinator needs.
#[async_trait]
pub trait MergeBackend: Send + Sync {
    /// Simulate merging `source` into `target`; returns the conflict count.
    async fn dry_run(&self, workdir: &Path, source: &str, target: &str) -> DomainResult<u32>;

    /// Merge `source` into the currently checked-out `target`.
    async fn apply(&self, workdir: &Path, source: &str, target: &str)
        -> DomainResult<ApplyOutcome>;

    /// Commit a resolved conflict state.
    async fn commit_resolution(&self, workdir: &Path, message: &str) -> DomainResult<String>;

    /// Abort an in-progress merge, leaving the tree clean.
    async fn abort(&self, workdir: &Path) -> DomainResult<()>;
}

/// Resolves conflicted files, typically by driving a coding agent.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, workdir: &Path, files: &[String]) -> DomainResult<Resolution>;
}

/// One resolution attempt's outcome and spend.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub resolved: bool,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Caps for LLM-assisted resolution across one merge attempt.
#[derive(Debug, Clone)]
pub struct ResolverLimits {
    pub max_invocations: u32,
    pub max_cost_usd: f64,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self {
            max_invocations: 5,
            max_cost_usd: 2.0,
        }
    }
}

/// One incoming branch from a succeeded sibling.
#[derive(Debug, Clone)]
pub struct IncomingBranch {
    pub task_id: Uuid,
    pub branch: String,
}

/// The merge coordinator (C9).
pub struct MergeCoordinator {
    merge_repo: Arc<dyn MergeRepository>,
    backend: Arc<dyn MergeBackend>,
    resolver: Arc<dyn ConflictResolver>,
    bus: Arc<EventBus>,
    limits: ResolverLimits,
    workdir: PathBuf,
}

impl MergeCoordinator {
    pub fn new(
        merge_repo: Arc<dyn MergeRepository>,
        backend: Arc<dyn MergeBackend>,
        resolver: Arc<dyn ConflictResolver>,
        bus: Arc<EventBus>,
        limits: ResolverLimits,
        workdir: PathBuf,
    ) -> Self {
        Self {
            merge_repo,
            backend,
            resolver,
            bus,
            limits,
            workdir,
        }
    }

    /// Run one convergence merge end to end.
    pub async fn run_convergence(
        &self,
        parent_task_id: Uuid,
        ticket_id: Option<Uuid>,
        mut incoming: Vec<IncomingBranch>,
        target_branch: &str,
    ) -> DomainResult<MergeAttempt> {
        let mut attempt = MergeAttempt::new(parent_task_id, target_branch);
        attempt.ticket_id = ticket_id;
        attempt.source_task_ids = incoming.iter().map(|b| b.task_id).collect();
        attempt.incoming_branches = incoming.iter().map(|b| b.branch.clone()).collect();
        attempt.status = MergeStatus::Running;
        self.merge_repo.create(&attempt).await?;

        // 1. Dry-run conflict scores.
        let mut scores: Vec<(Uuid, u32)> = Vec::with_capacity(incoming.len());
        for branch in &incoming {
            let conflicts = self
                .backend
                .dry_run(&self.workdir, &branch.branch, target_branch)
                .await?;
            attempt.record_score(branch.task_id, conflicts);
            scores.push((branch.task_id, conflicts));
        }

        // 2. Ascending by conflict score, ties by task id.
        incoming.sort_by_key(|b| {
            let score = scores
                .iter()
                .find(|(id, _)| *id == b.task_id)
                .map_or(0, |(_, s)| *s);
            (score, b.task_id)
        });
        attempt.merge_order = incoming.iter().map(|b| b.task_id).collect();

        // 3. Sequential apply with bounded resolution.
        for branch in &incoming {
            let outcome = self
                .backend
                .apply(&self.workdir, &branch.branch, target_branch)
                .await?;
            if outcome.merged {
                info!(branch = %branch.branch, "branch merged cleanly");
                continue;
            }

            match self.resolve_bounded(&mut attempt, &outcome.conflict_files).await {
                Ok(true) => {
                    let sha = self
                        .backend
                        .commit_resolution(
                            &self.workdir,
                            &format!("Resolve conflicts merging {}", branch.branch),
                        )
                        .await?;
                    info!(branch = %branch.branch, commit = %sha, "conflicts resolved");
                }
                Ok(false) | Err(_) => {
                    // Preserve partial state: merged branches stay merged,
                    // the conflicted one is aborted.
                    self.backend.abort(&self.workdir).await?;
                    attempt.finish(
                        MergeStatus::Failed,
                        Some(format!(
                            "unresolvable conflicts merging {} ({} files)",
                            branch.branch,
                            outcome.conflict_files.len()
                        )),
                    );
                    self.merge_repo.update(&attempt).await?;
                    self.publish("merge.failed", &attempt).await;
                    return Ok(attempt);
                }
            }
        }

        attempt.finish(
            MergeStatus::Succeeded,
            Some(format!("{} branches merged", attempt.merge_order.len())),
        );
        self.merge_repo.update(&attempt).await?;
        self.publish("merge.succeeded", &attempt).await;
        Ok(attempt)
    }

    /// Invoke the resolver within the attempt-wide caps.
    async fn resolve_bounded(
        &self,
        attempt: &mut MergeAttempt,
        files: &[String],
    ) -> DomainResult<bool> {
        if attempt.llm_invocations >= self.limits.max_invocations
            || attempt.cost_usd >= self.limits.max_cost_usd
        {
            warn!(
                invocations = attempt.llm_invocations,
                cost = attempt.cost_usd,
                "resolver limits reached"
            );
            return Ok(false);
        }

        let resolution = self.resolver.resolve(&self.workdir, files).await?;
        attempt.record_resolution(resolution.tokens, resolution.cost_usd);
        self.merge_repo.update(attempt).await?;
        Ok(resolution.resolved)
    }

    async fn publish(&self, event_type: &str, attempt: &MergeAttempt) {
        let envelope = EventEnvelope::new(
            event_type,
            EntityType::Merge,
            attempt.id.to_string(),
            json!({
                "task_id": attempt.task_id,
                "merge_order": attempt.merge_order,
                "conflict_scores": attempt.conflict_scores,
                "status": attempt.status.as_str(),
            }),
        );
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(error = %err, "failed to publish merge event");
        }
    }
}

/// `git`-backed merge operations.
pub struct GitMergeBackend;

impl GitMergeBackend {
    async fn git(workdir: &Path, args: &[&str]) -> DomainResult<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output()
            .await
            .map_err(|e| DomainError::Io(format!("git {}: {e}", args.join(" "))))
    }
}

#[async_trait]
impl MergeBackend for GitMergeBackend {
    async fn dry_run(&self, workdir: &Path, source: &str, target: &str) -> DomainResult<u32> {
        // merge-tree prints conflict information without touching the tree.
        let output = Self::git(
            workdir,
            &["merge-tree", "--write-tree", "--name-only", target, source],
        )
        .await?;
        if output.status.success() {
            return Ok(0);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // First line is the tree OID; conflicted paths follow until the
        // blank line that starts the informational section.
        let conflicts = stdout
            .lines()
            .skip(1)
            .take_while(|line| !line.trim().is_empty())
            .count() as u32;
        Ok(conflicts.max(1))
    }

    async fn apply(
        &self,
        workdir: &Path,
        source: &str,
        target: &str,
    ) -> DomainResult<ApplyOutcome> {
        let checkout = Self::git(workdir, &["checkout", target]).await?;
        if !checkout.status.success() {
            return Err(DomainError::Io(format!(
                "git checkout {target}: {}",
                String::from_utf8_lossy(&checkout.stderr)
            )));
        }

        let merge = Self::git(workdir, &["merge", "--no-ff", source]).await?;
        if merge.status.success() {
            let sha = Self::git(workdir, &["rev-parse", "HEAD"]).await?;
            return Ok(ApplyOutcome {
                merged: true,
                conflict_files: Vec::new(),
                commit_sha: Some(String::from_utf8_lossy(&sha.stdout).trim().to_string()),
            });
        }

        let conflicts = Self::git(workdir, &["diff", "--name-only", "--diff-filter=U"]).await?;
        let files = String::from_utf8_lossy(&conflicts.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(ApplyOutcome {
            merged: false,
            conflict_files: files,
            commit_sha: None,
        })
    }

    async fn commit_resolution(&self, workdir: &Path, message: &str) -> DomainResult<String> {
        let add = Self::git(workdir, &["add", "-A"]).await?;
        if !add.status.success() {
            return Err(DomainError::Io("git add failed".to_string()));
        }
        let commit = Self::git(workdir, &["commit", "-m", message]).await?;
        if !commit.status.success() {
            return Err(DomainError::Io(format!(
                "git commit: {}",
                String::from_utf8_lossy(&commit.stderr)
            )));
        }
        let sha = Self::git(workdir, &["rev-parse", "HEAD"]).await?;
        Ok(String::from_utf8_lossy(&sha.stdout).trim().to_string())
    }

    async fn abort(&self, workdir: &Path) -> DomainResult<()> {
        let _ = Self::git(workdir, &["merge", "--abort"]).await?;
        Ok(())
    }
}
