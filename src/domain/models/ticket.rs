//! Ticket domain model.
//!
//! Tickets are the human-facing unit of work. They gate their tasks through
//! an approval lifecycle and carry ticket-to-ticket dependencies as explicit
//! adjacency (blocked_by / blocks), never as stored pointer cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Ticket workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    InProgress,
    Review,
    Done,
    Archived,
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::Backlog
    }
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "in_progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Archived)
    }
}

/// Human approval state for a ticket. Only approved tickets schedule tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingReview,
    Approved,
    Rejected,
    TimedOut,
}

impl Default for ApprovalStatus {
    fn default() -> Self {
        Self::PendingReview
    }
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(Self::PendingReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::PendingReview)
    }

    /// Whether tasks under this ticket may be scheduled.
    pub fn can_proceed(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Ticket-to-ticket dependency adjacency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDependencies {
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub blocks: Vec<Uuid>,
}

/// A human-facing unit of work, decomposed into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Workflow phase label (free-form, e.g. "implementation")
    pub phase: Option<String>,
    pub status: TicketStatus,
    pub approval_status: ApprovalStatus,
    pub priority: f64,
    pub deadline: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    /// Owning project
    pub project_id: Option<Uuid>,
    /// Owning user
    pub user_id: Option<Uuid>,
    /// Spec this ticket was generated from
    pub spec_id: Option<Uuid>,
    pub dependencies: TicketDependencies,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Ticket {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            phase: None,
            status: TicketStatus::default(),
            approval_status: ApprovalStatus::default(),
            priority: 1.0,
            deadline: None,
            is_blocked: false,
            blocked_reason: None,
            project_id: None,
            user_id: None,
            spec_id: None,
            dependencies: TicketDependencies::default(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_spec(mut self, spec_id: Uuid) -> Self {
        self.spec_id = Some(spec_id);
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Approve the ticket for scheduling.
    pub fn approve(&mut self) -> DomainResult<()> {
        self.set_approval(ApprovalStatus::Approved)
    }

    /// Record a final approval decision. Final states do not change again.
    pub fn set_approval(&mut self, status: ApprovalStatus) -> DomainResult<()> {
        if self.approval_status.is_final() {
            return Err(DomainError::InvalidTransition {
                entity: "ticket_approval",
                from: self.approval_status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.approval_status = status;
        self.touch();
        Ok(())
    }

    /// Mark the ticket blocked with a reason.
    pub fn block(&mut self, reason: impl Into<String>) {
        self.is_blocked = true;
        self.blocked_reason = Some(reason.into());
        self.touch();
    }

    /// Clear the blocked flag.
    pub fn unblock(&mut self) {
        self.is_blocked = false;
        self.blocked_reason = None;
        self.touch();
    }

    /// Whether the scheduler may admit tasks referencing this ticket.
    pub fn is_schedulable(&self) -> bool {
        !self.is_blocked && self.approval_status.can_proceed() && !self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}
