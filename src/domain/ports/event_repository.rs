//! Sandbox event repository port. Append-only, idempotent by event id.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::SandboxEvent;

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event. Replaying the same `(sandbox_id, id)` must not
    /// create a duplicate row; returns `false` when the event already
    /// existed.
    async fn append(&self, event: &SandboxEvent) -> DomainResult<bool>;

    async fn list_by_sandbox(
        &self,
        sandbox_id: &str,
        limit: usize,
    ) -> DomainResult<Vec<SandboxEvent>>;

    async fn list_by_spec(&self, spec_id: Uuid, limit: usize) -> DomainResult<Vec<SandboxEvent>>;

    async fn count_by_sandbox(&self, sandbox_id: &str) -> DomainResult<u64>;
}
