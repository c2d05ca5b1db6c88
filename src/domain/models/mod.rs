//! Domain models for the orchestration kernel.

pub mod agent;
pub mod allocation;
pub mod config;
pub mod cost;
pub mod event;
pub mod guardian;
pub mod heartbeat;
pub mod merge;
pub mod spec;
pub mod task;
pub mod ticket;

pub use agent::{Agent, AgentBaseline, AgentStatus, HealthMetrics};
pub use allocation::{ResourceEnvelope, SandboxResourceAllocation};
pub use config::Config;
pub use cost::{Budget, BudgetPeriod, BudgetScope, CostRecord};
pub use event::{EntityType, EventEnvelope, EventSource, SandboxEvent};
pub use guardian::{ActionStatus, AuditEntry, GuardianAction, GuardianActionType};
pub use heartbeat::{HeartbeatAck, HeartbeatMessage};
pub use merge::{MergeAttempt, MergeStatus};
pub use spec::{EvalResult, PhaseResult, Spec, SpecPhase};
pub use task::{ExecutionConfig, FailureKind, PermissionMode, Task, TaskStatus};
pub use ticket::{ApprovalStatus, Ticket, TicketDependencies, TicketStatus};
