//! Orchestration services.

pub mod cost_accountant;
pub mod event_bus;
pub mod guardian;
pub mod heartbeat_monitor;
pub mod merge_coordinator;
pub mod orchestrator;
pub mod scheduler;

pub use cost_accountant::{CostAccountant, Reservation};
pub use event_bus::{EventBus, EventBusConfig, EventFilter, EventSink, EventStream};
pub use guardian::{Guardian, Incident, IncidentKind};
pub use heartbeat_monitor::{AnomalyWeights, Escalation, HeartbeatMonitor};
pub use merge_coordinator::{
    ApplyOutcome, ConflictResolver, GitMergeBackend, IncomingBranch, MergeBackend,
    MergeCoordinator, Resolution, ResolverLimits,
};
pub use orchestrator::{OrchestratorWorker, WorkerBundle};
pub use scheduler::{ScoreWeights, TaskScheduler};
