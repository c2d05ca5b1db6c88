//! Event envelopes for the bus and the sandbox event stream.
//!
//! Two shapes: `EventEnvelope` is the in-process bus unit with entity
//! addressing for filtered fan-out; `SandboxEvent` is the append-only
//! record streamed from workers, idempotent by `(sandbox_id, id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity addressing for bus filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Ticket,
    Spec,
    Agent,
    Sandbox,
    Budget,
    Merge,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Ticket => "ticket",
            Self::Spec => "spec",
            Self::Agent => "agent",
            Self::Sandbox => "sandbox",
            Self::Budget => "budget",
            Self::Merge => "merge",
        }
    }
}

/// Typed envelope published on the in-process event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Dotted namespace, e.g. `task.succeeded`, `agent.degraded`
    pub event_type: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            entity_type,
            entity_id: entity_id.into(),
            payload,
            at: Utc::now(),
        }
    }
}

/// Who produced a sandbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    Worker,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Worker => "worker",
            Self::System => "system",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "worker" => Some(Self::Worker),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Append-only record streamed from a sandbox worker.
///
/// Events carry their id on the wire so the store can deduplicate
/// at-least-once deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub id: Uuid,
    pub sandbox_id: String,
    /// Dotted namespace, e.g. `agent.tool_use`, `heartbeat`
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub source: EventSource,
    pub spec_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SandboxEvent {
    pub fn new(
        sandbox_id: impl Into<String>,
        event_type: impl Into<String>,
        event_data: serde_json::Value,
        source: EventSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sandbox_id: sandbox_id.into(),
            event_type: event_type.into(),
            event_data,
            source,
            spec_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_spec(mut self, spec_id: Uuid) -> Self {
        self.spec_id = Some(spec_id);
        self
    }
}

/// Well-known sandbox event types.
pub mod event_types {
    pub const AGENT_TEXT: &str = "agent.text";
    pub const AGENT_THINKING: &str = "agent.thinking";
    pub const AGENT_TOOL_USE: &str = "agent.tool_use";
    pub const AGENT_TOOL_RESULT: &str = "agent.tool_result";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const AGENT_FAILED: &str = "agent.failed";
    pub const AGENT_BUDGET_EXHAUSTED: &str = "agent.budget_exhausted";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SPEC_STARTED: &str = "spec.started";
    pub const SPEC_COMPLETED: &str = "spec.completed";
    pub const SPEC_FAILED: &str = "spec.failed";
    pub const PHASE_STARTED: &str = "spec.phase_started";
    pub const PHASE_COMPLETED: &str = "spec.phase_completed";
    pub const PHASE_RETRY: &str = "spec.phase_retry";
    pub const ARTIFACT_CREATED: &str = "spec.artifact_created";
    pub const MERGE_REQUIRED: &str = "task.merge_required";
    pub const COST_PRESSURE: &str = "budget.cost_pressure";
}
