//! Ports: the seams between the kernel and its collaborators.

pub mod agent_driver;
pub mod agent_repository;
pub mod allocation_repository;
pub mod callback;
pub mod cost_repository;
pub mod event_repository;
pub mod guardian_repository;
pub mod merge_repository;
pub mod phase;
pub mod reporter;
pub mod sandbox_provider;
pub mod spec_repository;
pub mod task_repository;
pub mod ticket_repository;

pub use agent_driver::{
    AgentBlock, AgentDriver, AgentSession, FileChange, SessionOptions, TurnUsage,
};
pub use agent_repository::AgentRepository;
pub use allocation_repository::AllocationRepository;
pub use callback::{InjectedMessage, MessageBatch, MessageKind, OrchestratorApi, SyncSummary};
pub use cost_repository::CostRepository;
pub use event_repository::EventRepository;
pub use guardian_repository::GuardianRepository;
pub use merge_repository::MergeRepository;
pub use phase::{PhaseContext, PhaseEvaluator, PhaseExecution, PhaseExecutor};
pub use reporter::EventReporter;
pub use sandbox_provider::{ExecResult, PreviewLink, Sandbox, SandboxProvider};
pub use spec_repository::SpecRepository;
pub use task_repository::{TaskFilter, TaskRepository};
pub use ticket_repository::TicketRepository;
