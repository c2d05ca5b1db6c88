//! Merge coordinator tests: conflict-score ordering, bounded resolution,
//! and failure preservation (scripted git backend).

mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use foreman::domain::errors::DomainResult;
use foreman::domain::models::MergeStatus;
use foreman::domain::ports::MergeRepository;
use foreman::services::{
    ApplyOutcome, ConflictResolver, EventBus, IncomingBranch, MergeBackend, MergeCoordinator,
    Resolution, ResolverLimits,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Scripted backend: conflict scores per branch, recorded apply order.
struct ScriptedBackend {
    scores: HashMap<String, u32>,
    /// Branches whose apply reports conflicts
    conflicted_applies: Vec<String>,
    applied: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(scores: &[(&str, u32)]) -> Self {
        Self {
            scores: scores
                .iter()
                .map(|(branch, score)| ((*branch).to_string(), *score))
                .collect(),
            conflicted_applies: Vec::new(),
            applied: Mutex::new(Vec::new()),
        }
    }

    fn with_conflicted_applies(mut self, branches: &[&str]) -> Self {
        self.conflicted_applies = branches.iter().map(|s| (*s).to_string()).collect();
        self
    }
}

#[async_trait]
impl MergeBackend for ScriptedBackend {
    async fn dry_run(&self, _workdir: &Path, source: &str, _target: &str) -> DomainResult<u32> {
        Ok(self.scores.get(source).copied().unwrap_or(0))
    }

    async fn apply(
        &self,
        _workdir: &Path,
        source: &str,
        _target: &str,
    ) -> DomainResult<ApplyOutcome> {
        self.applied.lock().await.push(source.to_string());
        if self.conflicted_applies.contains(&source.to_string()) {
            Ok(ApplyOutcome {
                merged: false,
                conflict_files: vec!["src/conflicted.rs".to_string()],
                commit_sha: None,
            })
        } else {
            Ok(ApplyOutcome {
                merged: true,
                conflict_files: Vec::new(),
                commit_sha: Some("abc123".to_string()),
            })
        }
    }

    async fn commit_resolution(&self, _workdir: &Path, _message: &str) -> DomainResult<String> {
        Ok("resolved123".to_string())
    }

    async fn abort(&self, _workdir: &Path) -> DomainResult<()> {
        Ok(())
    }
}

struct AlwaysResolves;

#[async_trait]
impl ConflictResolver for AlwaysResolves {
    async fn resolve(&self, _workdir: &Path, _files: &[String]) -> DomainResult<Resolution> {
        Ok(Resolution {
            resolved: true,
            tokens: 1200,
            cost_usd: 0.02,
        })
    }
}

struct NeverResolves;

#[async_trait]
impl ConflictResolver for NeverResolves {
    async fn resolve(&self, _workdir: &Path, _files: &[String]) -> DomainResult<Resolution> {
        Ok(Resolution {
            resolved: false,
            tokens: 800,
            cost_usd: 0.01,
        })
    }
}

fn branches() -> (Vec<IncomingBranch>, [Uuid; 3]) {
    // Fixed ids so tie-breaks are predictable.
    let mut ids = [Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)];
    ids.sort();
    let incoming = vec![
        IncomingBranch {
            task_id: ids[0],
            branch: "feature/c1".to_string(),
        },
        IncomingBranch {
            task_id: ids[1],
            branch: "feature/c2".to_string(),
        },
        IncomingBranch {
            task_id: ids[2],
            branch: "feature/c3".to_string(),
        },
    ];
    (incoming, ids)
}

#[tokio::test]
async fn merges_in_ascending_conflict_order() {
    // S6: conflict scores {c1: 0, c2: 2, c3: 1} → order c1, c3, c2.
    let repos = common::repos().await;
    let backend = Arc::new(
        ScriptedBackend::new(&[("feature/c1", 0), ("feature/c2", 2), ("feature/c3", 1)]),
    );
    let coordinator = MergeCoordinator::new(
        repos.merges.clone(),
        backend.clone(),
        Arc::new(AlwaysResolves),
        Arc::new(EventBus::default()),
        ResolverLimits::default(),
        PathBuf::from("."),
    );

    let (incoming, ids) = branches();
    let parent = Uuid::new_v4();
    let attempt = coordinator
        .run_convergence(parent, None, incoming, "main")
        .await
        .unwrap();

    assert_eq!(attempt.status, MergeStatus::Succeeded);
    assert_eq!(attempt.merge_order, vec![ids[0], ids[2], ids[1]]);
    assert_eq!(
        backend.applied.lock().await.as_slice(),
        ["feature/c1", "feature/c3", "feature/c2"]
    );

    // Audit record persisted with scores and outcome.
    let stored = repos.merges.list_for_task(parent).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].conflict_scores.len(), 3);
    assert_eq!(stored[0].status, MergeStatus::Succeeded);
}

#[tokio::test]
async fn conflicts_resolved_within_limits_succeed() {
    let repos = common::repos().await;
    let backend = Arc::new(
        ScriptedBackend::new(&[("feature/c1", 1)]).with_conflicted_applies(&["feature/c1"]),
    );
    let coordinator = MergeCoordinator::new(
        repos.merges.clone(),
        backend,
        Arc::new(AlwaysResolves),
        Arc::new(EventBus::default()),
        ResolverLimits::default(),
        PathBuf::from("."),
    );

    let attempt = coordinator
        .run_convergence(
            Uuid::new_v4(),
            None,
            vec![IncomingBranch {
                task_id: Uuid::new_v4(),
                branch: "feature/c1".to_string(),
            }],
            "main",
        )
        .await
        .unwrap();

    assert_eq!(attempt.status, MergeStatus::Succeeded);
    assert_eq!(attempt.llm_invocations, 1);
    assert_eq!(attempt.tokens_spent, 1200);
    assert!((attempt.cost_usd - 0.02).abs() < 1e-9);
}

#[tokio::test]
async fn unresolvable_conflict_fails_and_preserves_state() {
    let repos = common::repos().await;
    let backend = Arc::new(
        ScriptedBackend::new(&[("feature/c1", 0), ("feature/c2", 3)])
            .with_conflicted_applies(&["feature/c2"]),
    );
    let coordinator = MergeCoordinator::new(
        repos.merges.clone(),
        backend.clone(),
        Arc::new(NeverResolves),
        Arc::new(EventBus::default()),
        ResolverLimits::default(),
        PathBuf::from("."),
    );

    let clean_id = Uuid::from_u128(1);
    let conflicted_id = Uuid::from_u128(2);
    let attempt = coordinator
        .run_convergence(
            Uuid::new_v4(),
            None,
            vec![
                IncomingBranch {
                    task_id: clean_id,
                    branch: "feature/c1".to_string(),
                },
                IncomingBranch {
                    task_id: conflicted_id,
                    branch: "feature/c2".to_string(),
                },
            ],
            "main",
        )
        .await
        .unwrap();

    assert_eq!(attempt.status, MergeStatus::Failed);
    // The clean branch was merged first; the partial state survives.
    assert_eq!(
        backend.applied.lock().await.as_slice(),
        ["feature/c1", "feature/c2"]
    );
    assert!(attempt.outcome.unwrap().contains("feature/c2"));
}

#[tokio::test]
async fn resolver_invocation_limit_is_enforced() {
    let repos = common::repos().await;
    let backend = Arc::new(
        ScriptedBackend::new(&[("feature/c1", 1)]).with_conflicted_applies(&["feature/c1"]),
    );
    let coordinator = MergeCoordinator::new(
        repos.merges.clone(),
        backend,
        Arc::new(AlwaysResolves),
        Arc::new(EventBus::default()),
        ResolverLimits {
            max_invocations: 0,
            max_cost_usd: 2.0,
        },
        PathBuf::from("."),
    );

    let attempt = coordinator
        .run_convergence(
            Uuid::new_v4(),
            None,
            vec![IncomingBranch {
                task_id: Uuid::new_v4(),
                branch: "feature/c1".to_string(),
            }],
            "main",
        )
        .await
        .unwrap();

    // With zero allowed invocations the conflict is unresolvable.
    assert_eq!(attempt.status, MergeStatus::Failed);
    assert_eq!(attempt.llm_invocations, 0);
}
