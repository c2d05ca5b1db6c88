//! Event reporter port for the sandbox worker.
//!
//! Reporters deliver `SandboxEvent`s to a destination (memory, file, HTTP)
//! with at-least-once semantics; events carry ids for downstream dedup.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::SandboxEvent;

#[async_trait]
pub trait EventReporter: Send + Sync {
    /// Deliver one event. Implementations retry transient failures
    /// internally and surface permanent ones.
    async fn report(&self, event: SandboxEvent) -> DomainResult<()>;

    /// Flush any buffered events.
    async fn flush(&self) -> DomainResult<()>;
}
