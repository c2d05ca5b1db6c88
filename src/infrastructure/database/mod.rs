//! SQLite-backed entity store.

pub mod agent_repo;
pub mod allocation_repo;
pub mod connection;
pub mod cost_repo;
pub mod event_repo;
pub mod guardian_repo;
pub mod merge_repo;
pub mod spec_repo;
pub mod task_repo;
pub mod ticket_repo;
pub mod utils;

pub use agent_repo::AgentRepositoryImpl;
pub use allocation_repo::AllocationRepositoryImpl;
pub use connection::DatabaseConnection;
pub use cost_repo::CostRepositoryImpl;
pub use event_repo::{BusEventSink, EventRepositoryImpl};
pub use guardian_repo::GuardianRepositoryImpl;
pub use merge_repo::MergeRepositoryImpl;
pub use spec_repo::SpecRepositoryImpl;
pub use task_repo::TaskRepositoryImpl;
pub use ticket_repo::TicketRepositoryImpl;
