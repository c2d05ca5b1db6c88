//! Worker ↔ orchestrator callback boundary.
//!
//! The sandbox worker reaches the orchestrator only through this port
//! (outbound HTTP in production, in-process fakes in tests). Message
//! injection uses a per-sandbox monotone cursor: a poll with cursor C
//! returns only messages with `offset > C`, in order, at-least-once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{HeartbeatAck, HeartbeatMessage, SandboxEvent};

/// Kind of an injected message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// Operator or user text delivered as a continuation
    UserMessage,
    /// Cooperative cancellation request
    Interrupt,
    /// Guardian advisory; `cancel` asks the agent to stop cleanly
    GuardianNudge { cancel: bool },
    /// Orchestrator housekeeping
    System,
}

/// A message queued for injection into a running agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedMessage {
    pub id: Uuid,
    /// Position in the per-sandbox queue; strictly increasing
    pub offset: u64,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub content: String,
}

impl InjectedMessage {
    /// Whether this message asks the agent to stop.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Interrupt | MessageKind::GuardianNudge { cancel: true }
        )
    }
}

/// One poll's worth of messages plus the cursor to ack next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub messages: Vec<InjectedMessage>,
    pub next_cursor: u64,
}

/// Final summary uploaded when a spec-running worker finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub spec_id: Uuid,
    pub phase_data: serde_json::Value,
    pub total_cost_usd: f64,
    pub session_id: Option<String>,
}

/// Outbound boundary from the worker to the orchestrator (§6.1).
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// POST /sandbox/events — idempotent by event id.
    async fn post_event(&self, event: &SandboxEvent) -> DomainResult<()>;

    /// GET /sandbox/{id}/messages?cursor= — ordered messages after the cursor.
    async fn poll_messages(&self, sandbox_id: &str, cursor: u64) -> DomainResult<MessageBatch>;

    /// POST /heartbeats.
    async fn post_heartbeat(&self, heartbeat: &HeartbeatMessage) -> DomainResult<HeartbeatAck>;

    /// POST /sandbox/sync-summary — final phase_data upload.
    async fn post_sync_summary(&self, summary: &SyncSummary) -> DomainResult<()>;

    /// POST /conversations/register — bind (task, sandbox, conversation).
    async fn register_conversation(
        &self,
        task_id: Uuid,
        sandbox_id: &str,
        conversation_id: &str,
    ) -> DomainResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_detection() {
        let interrupt = InjectedMessage {
            id: Uuid::new_v4(),
            offset: 1,
            kind: MessageKind::Interrupt,
            content: String::new(),
        };
        assert!(interrupt.is_cancellation());

        let nudge = InjectedMessage {
            id: Uuid::new_v4(),
            offset: 2,
            kind: MessageKind::GuardianNudge { cancel: false },
            content: "slow down".into(),
        };
        assert!(!nudge.is_cancellation());

        let cancel_nudge = InjectedMessage {
            id: Uuid::new_v4(),
            offset: 3,
            kind: MessageKind::GuardianNudge { cancel: true },
            content: "stop cleanly".into(),
        };
        assert!(cancel_nudge.is_cancellation());
    }

    #[test]
    fn test_message_serde_flattens_kind() {
        let msg = InjectedMessage {
            id: Uuid::new_v4(),
            offset: 9,
            kind: MessageKind::UserMessage,
            content: "hello".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "user_message");
        let parsed: InjectedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }
}
