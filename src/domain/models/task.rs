//! Task domain model.
//!
//! Tasks are the executable decomposition of tickets. They form a DAG via
//! `depends_on`, carry a dynamically computed scheduling score, and are
//! driven through a strict status state machine by the scheduler and the
//! sandbox workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Defined but not yet handed to a sandbox
    Pending,
    /// Selected by the scheduler, sandbox acquisition in progress
    Assigned,
    /// Executing inside a sandbox
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished unsuccessfully
    Failed,
    /// Canceled before completion
    Canceled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Assigned, Self::Canceled, Self::Failed],
            Self::Assigned => &[Self::Running, Self::Pending, Self::Canceled, Self::Failed],
            Self::Running => &[Self::Succeeded, Self::Failed, Self::Canceled],
            Self::Failed => &[Self::Pending], // retry path
            Self::Succeeded | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Classification of a task failure, used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Sandbox flake, network, rate limit — eligible for retry with backoff.
    Transient,
    /// Schema violation, invalid transition, settled budget overrun.
    Permanent,
    /// A dependency terminally failed.
    UpstreamFailed,
    /// Task-level timeout expired after assignment.
    DeadlineExceeded,
    /// Sandbox acquisition kept failing past the retry limit.
    SandboxUnavailable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::UpstreamFailed => "upstream_failed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::SandboxUnavailable => "sandbox_unavailable",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "upstream_failed" => Some(Self::UpstreamFailed),
            "deadline_exceeded" => Some(Self::DeadlineExceeded),
            "sandbox_unavailable" => Some(Self::SandboxUnavailable),
            _ => None,
        }
    }

    /// Only transient failures return the task to the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Permission mode handed to the coding agent inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    AcceptEdits,
    AskEach,
    ReadOnly,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::AcceptEdits
    }
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptEdits => "acceptEdits",
            Self::AskEach => "askEach",
            Self::ReadOnly => "readOnly",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "acceptEdits" => Some(Self::AcceptEdits),
            "askEach" => Some(Self::AskEach),
            "readOnly" => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

/// Execution envelope handed to the sandbox worker together with the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Model the sandbox worker should drive (provider default when None).
    pub model: Option<String>,
    /// Maximum agent turns before the worker stops.
    pub max_turns: u32,
    /// Maximum spend in USD for this task's conversation.
    pub max_budget_usd: f64,
    /// Wall-clock ceiling in seconds.
    pub max_duration_secs: u64,
    /// Agent permission mode.
    pub permission_mode: PermissionMode,
    /// Allowed tool names (empty = worker defaults).
    pub allowed_tools: Vec<String>,
    /// Iterate until a completion signal is observed.
    pub continuous: bool,
    /// Validate spec-output frontmatter before reporting success.
    pub require_spec_skill: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_turns: 50,
            max_budget_usd: 10.0,
            max_duration_secs: 3600,
            permission_mode: PermissionMode::default(),
            allowed_tools: Vec::new(),
            continuous: false,
            require_spec_skill: false,
        }
    }
}

/// A discrete unit of work executed by a coding agent in a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Ticket this task implements (convergence tasks share the ticket)
    pub ticket_id: Option<Uuid>,
    /// Parent task for parallel sibling groups
    pub parent_task_id: Option<Uuid>,
    /// Human-readable title
    pub title: String,
    /// Full prompt/description handed to the agent
    pub description: String,
    /// Current status
    pub status: TaskStatus,
    /// Static priority input to the scheduling score
    pub priority_base: f64,
    /// Dynamic scheduling score (recomputed at admission and on dependency change)
    pub score: f64,
    /// Optional SLA deadline
    pub deadline: Option<DateTime<Utc>>,
    /// Retry count
    pub retry_count: u32,
    /// Maximum retries
    pub max_retries: u32,
    /// Task-level timeout, measured from assignment
    pub timeout_seconds: Option<u64>,
    /// Capabilities an agent must offer to run this task
    pub required_capabilities: Vec<String>,
    /// Task IDs this depends on
    pub depends_on: Vec<Uuid>,
    /// Glob patterns this task claims exclusive write access to
    pub owned_files: Vec<String>,
    /// Opaque context propagated from planning/synthesis
    pub synthesis_context: Option<serde_json::Value>,
    /// Sandbox currently executing this task
    pub sandbox_id: Option<String>,
    /// Agent currently assigned
    pub assigned_agent: Option<Uuid>,
    /// Execution envelope
    pub execution_config: ExecutionConfig,
    /// Directory the worker persists artifacts under
    pub persistence_dir: Option<String>,
    /// Optional embedding for semantic duplicate hints. Similarity results
    /// are hints only; deduplication requires an exact-rule confirmation.
    pub embedding: Option<Vec<f32>>,
    /// Why the task failed, when it did
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished
    pub completed_at: Option<DateTime<Utc>>,
    /// Version for optimistic locking
    pub version: u64,
}

impl Task {
    /// Create a new task with a title and prompt.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticket_id: None,
            parent_task_id: None,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::default(),
            priority_base: 1.0,
            score: 0.0,
            deadline: None,
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: None,
            required_capabilities: Vec::new(),
            depends_on: Vec::new(),
            owned_files: Vec::new(),
            synthesis_context: None,
            sandbox_id: None,
            assigned_agent: None,
            execution_config: ExecutionConfig::default(),
            persistence_dir: None,
            embedding: None,
            failure_kind: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 1,
        }
    }

    /// Attach to a ticket.
    pub fn with_ticket(mut self, ticket_id: Uuid) -> Self {
        self.ticket_id = Some(ticket_id);
        self
    }

    /// Set parent task.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_id);
        self
    }

    /// Add a dependency (self-dependencies and duplicates ignored).
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    /// Set the base priority.
    pub fn with_priority(mut self, priority_base: f64) -> Self {
        self.priority_base = priority_base;
        self
    }

    /// Set the SLA deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Declare required capabilities.
    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    /// Declare owned file globs.
    pub fn with_owned_files(mut self, globs: Vec<String>) -> Self {
        self.owned_files = globs;
        self
    }

    /// Set the execution envelope.
    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution_config = config;
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, updating timestamps and version.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> DomainResult<()> {
        if !self.can_transition_to(new_status) {
            return Err(DomainError::InvalidTransition {
                entity: "task",
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        self.version += 1;

        match new_status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Record a failure with its classification.
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) -> DomainResult<()> {
        self.failure_kind = Some(kind);
        self.failure_reason = Some(reason.into());
        self.transition_to(TaskStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A failed task may retry while under the retry cap and the failure is retryable.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.retry_count < self.max_retries
            && self.failure_kind.map_or(false, |k| k.is_retryable())
    }

    /// Increment retry count and return to Pending.
    pub fn retry(&mut self) -> DomainResult<()> {
        if !self.can_retry() {
            return Err(DomainError::ValidationFailed(
                "task cannot be retried: not failed, failure not retryable, or max retries reached"
                    .to_string(),
            ));
        }
        self.retry_count += 1;
        self.failure_kind = None;
        self.failure_reason = None;
        self.transition_to(TaskStatus::Pending)
    }

    /// Validate structural invariants before persistence.
    pub fn validate(&self) -> DomainResult<()> {
        if self.title.is_empty() {
            return Err(DomainError::ValidationFailed(
                "task title cannot be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "task description cannot be empty".to_string(),
            ));
        }
        if self.depends_on.contains(&self.id) {
            return Err(DomainError::ValidationFailed(
                "task cannot depend on itself".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("Implement login", "Implement the login feature");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.version, 1);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition_to(TaskStatus::Succeeded).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut task = Task::new("t", "d");
        // Pending → Running must go through Assigned
        assert!(task.transition_to(TaskStatus::Running).is_err());
        // Pending → Succeeded never valid
        assert!(task.transition_to(TaskStatus::Succeeded).is_err());

        task.transition_to(TaskStatus::Canceled).unwrap();
        // Terminal states have no outgoing edges
        assert!(task.transition_to(TaskStatus::Pending).is_err());
        assert!(task.transition_to(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_assigned_requeue() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Assigned).unwrap();
        // Scheduler may push an assigned task back when admission checks fail
        assert!(task.transition_to(TaskStatus::Pending).is_ok());
    }

    #[test]
    fn test_retry_only_for_transient_failures() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.fail(FailureKind::Transient, "sandbox flake").unwrap();
        assert!(task.can_retry());
        task.retry().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.failure_kind.is_none());

        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.fail(FailureKind::Permanent, "schema violation").unwrap();
        assert!(!task.can_retry());
        assert!(task.retry().is_err());
    }

    #[test]
    fn test_retry_cap() {
        let mut task = Task::new("t", "d");
        task.max_retries = 1;
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.fail(FailureKind::Transient, "flake").unwrap();
        task.retry().unwrap();
        task.transition_to(TaskStatus::Assigned).unwrap();
        task.transition_to(TaskStatus::Running).unwrap();
        task.fail(FailureKind::Transient, "flake again").unwrap();
        assert!(!task.can_retry());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut task = Task::new("t", "d");
        let own_id = task.id;
        task = task.with_dependency(own_id);
        assert!(task.depends_on.is_empty());

        task.depends_on.push(own_id);
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_version_bumps_on_transition() {
        let mut task = Task::new("t", "d");
        let v = task.version;
        task.transition_to(TaskStatus::Assigned).unwrap();
        assert_eq!(task.version, v + 1);
    }

    #[test]
    fn test_failure_kind_retryable() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::UpstreamFailed.is_retryable());
        assert!(!FailureKind::DeadlineExceeded.is_retryable());
        assert!(!FailureKind::SandboxUnavailable.is_retryable());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("cancelled"), Some(TaskStatus::Canceled));
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }
}
