//! Guardian remediation actions and their audit trail.
//!
//! Actions are ranked by authority level. Anything above the configured
//! auto-approval authority stays `pending_review` until approved or timed
//! out; a timed-out action is never executed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Remediation actions, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianActionType {
    /// Inject an advisory message into the agent's conversation
    Nudge,
    /// Move the agent out of rotation
    PauseAgent,
    /// Adjust the sandbox resource envelope
    ResizeResources,
    /// Recycle the sandbox, preserving the conversation
    RestartSandbox,
    /// Permanently terminate the agent
    TerminateAgent,
}

impl GuardianActionType {
    /// Authority rank; higher ranks require approval above `auto_authority`.
    pub fn authority_level(&self) -> u8 {
        match self {
            Self::Nudge => 1,
            Self::PauseAgent => 2,
            Self::ResizeResources => 3,
            Self::RestartSandbox => 4,
            Self::TerminateAgent => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nudge => "nudge",
            Self::PauseAgent => "pause_agent",
            Self::ResizeResources => "resize_resources",
            Self::RestartSandbox => "restart_sandbox",
            Self::TerminateAgent => "terminate_agent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "nudge" => Some(Self::Nudge),
            "pause_agent" => Some(Self::PauseAgent),
            "resize_resources" => Some(Self::ResizeResources),
            "restart_sandbox" => Some(Self::RestartSandbox),
            "terminate_agent" => Some(Self::TerminateAgent),
            _ => None,
        }
    }
}

/// Lifecycle of a guardian action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Awaiting an approver
    PendingReview,
    /// Approved, not yet executed
    Approved,
    /// Applied to the target
    Executed,
    /// Approver declined
    Rejected,
    /// Approval window expired; never executed
    TimedOut,
    /// Executed and later rolled back
    Reverted,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::Reverted => "reverted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(Self::PendingReview),
            "approved" => Some(Self::Approved),
            "executed" => Some(Self::Executed),
            "rejected" => Some(Self::Rejected),
            "timed_out" => Some(Self::TimedOut),
            "reverted" => Some(Self::Reverted),
            _ => None,
        }
    }
}

/// One entry in an action's audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub note: String,
}

/// A policy-chosen remediation with full audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianAction {
    pub id: Uuid,
    pub action: GuardianActionType,
    pub target_agent: Option<Uuid>,
    pub target_task: Option<Uuid>,
    pub authority_level: u8,
    pub reason: String,
    /// Policy or operator that raised the action
    pub initiator: String,
    pub approved_by: Option<String>,
    pub status: ActionStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub reverted_at: Option<DateTime<Utc>>,
    pub audit_log: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl GuardianAction {
    pub fn new(
        action: GuardianActionType,
        reason: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        let initiator = initiator.into();
        Self {
            id: Uuid::new_v4(),
            action,
            target_agent: None,
            target_task: None,
            authority_level: action.authority_level(),
            reason: reason.clone(),
            initiator: initiator.clone(),
            approved_by: None,
            status: ActionStatus::PendingReview,
            executed_at: None,
            reverted_at: None,
            audit_log: vec![AuditEntry {
                at: Utc::now(),
                note: format!("raised by {initiator}: {reason}"),
            }],
            created_at: Utc::now(),
            version: 1,
        }
    }

    pub fn with_target_agent(mut self, agent_id: Uuid) -> Self {
        self.target_agent = Some(agent_id);
        self
    }

    pub fn with_target_task(mut self, task_id: Uuid) -> Self {
        self.target_task = Some(task_id);
        self
    }

    /// Approve (or auto-approve when authority permits).
    pub fn approve(&mut self, approver: impl Into<String>) -> DomainResult<()> {
        self.require_status(ActionStatus::PendingReview, ActionStatus::Approved)?;
        let approver = approver.into();
        self.approved_by = Some(approver.clone());
        self.status = ActionStatus::Approved;
        self.log(format!("approved by {approver}"));
        Ok(())
    }

    pub fn reject(&mut self, approver: impl Into<String>) -> DomainResult<()> {
        self.require_status(ActionStatus::PendingReview, ActionStatus::Rejected)?;
        let approver = approver.into();
        self.status = ActionStatus::Rejected;
        self.log(format!("rejected by {approver}"));
        Ok(())
    }

    /// Expire the approval window. Timed-out actions are never executed.
    pub fn time_out(&mut self) -> DomainResult<()> {
        self.require_status(ActionStatus::PendingReview, ActionStatus::TimedOut)?;
        self.status = ActionStatus::TimedOut;
        self.log("approval window expired".to_string());
        Ok(())
    }

    pub fn mark_executed(&mut self) -> DomainResult<()> {
        self.require_status(ActionStatus::Approved, ActionStatus::Executed)?;
        self.status = ActionStatus::Executed;
        self.executed_at = Some(Utc::now());
        self.log("executed".to_string());
        Ok(())
    }

    pub fn mark_reverted(&mut self) -> DomainResult<()> {
        self.require_status(ActionStatus::Executed, ActionStatus::Reverted)?;
        self.status = ActionStatus::Reverted;
        self.reverted_at = Some(Utc::now());
        self.log("reverted".to_string());
        Ok(())
    }

    fn require_status(&self, expected: ActionStatus, target: ActionStatus) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::InvalidTransition {
                entity: "guardian_action",
                from: self.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn log(&mut self, note: String) {
        self.audit_log.push(AuditEntry {
            at: Utc::now(),
            note,
        });
        self.version += 1;
    }
}
