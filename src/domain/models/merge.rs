//! Merge attempt audit records for parallel task convergence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a convergence merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Audit record of one convergence merge: the dry-run scores, chosen order,
/// LLM-assisted resolution spend, and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAttempt {
    pub id: Uuid,
    /// The parent/convergence task
    pub task_id: Uuid,
    pub ticket_id: Option<Uuid>,
    /// Sibling tasks whose branches converge
    pub source_task_ids: Vec<Uuid>,
    pub incoming_branches: Vec<String>,
    pub target_branch: String,
    /// Apply order (ascending conflict score, ties by task id)
    pub merge_order: Vec<Uuid>,
    /// Dry-run conflict count per source task id
    pub conflict_scores: BTreeMap<String, u32>,
    pub status: MergeStatus,
    pub llm_invocations: u32,
    pub tokens_spent: u64,
    pub cost_usd: f64,
    /// Human-readable outcome / failure detail
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MergeAttempt {
    pub fn new(task_id: Uuid, target_branch: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            ticket_id: None,
            source_task_ids: Vec::new(),
            incoming_branches: Vec::new(),
            target_branch: target_branch.into(),
            merge_order: Vec::new(),
            conflict_scores: BTreeMap::new(),
            status: MergeStatus::Pending,
            llm_invocations: 0,
            tokens_spent: 0,
            cost_usd: 0.0,
            outcome: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn record_score(&mut self, task_id: Uuid, conflicts: u32) {
        self.conflict_scores.insert(task_id.to_string(), conflicts);
    }

    pub fn record_resolution(&mut self, tokens: u64, cost_usd: f64) {
        self.llm_invocations += 1;
        self.tokens_spent += tokens;
        self.cost_usd += cost_usd;
    }

    pub fn finish(&mut self, status: MergeStatus, outcome: Option<String>) {
        self.status = status;
        self.outcome = outcome;
        self.completed_at = Some(Utc::now());
    }
}
