//! The sandbox worker runtime and its collaborators.

pub mod config;
pub mod continuous;
pub mod diff;
pub mod heartbeat;
pub mod poller;
pub mod reporter;
pub mod runtime;
pub mod spec;

pub use config::WorkerConfig;
pub use continuous::{ContinuousState, GitTreeState};
pub use poller::MessagePoller;
pub use reporter::{ArrayReporter, HttpReporter, JsonlReporter};
pub use runtime::{SandboxWorker, WorkerOutcome};
