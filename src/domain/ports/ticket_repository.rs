//! Ticket repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Ticket, TicketStatus};

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>>;

    async fn update_with_version_check(
        &self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> DomainResult<()>;

    async fn list_by_status(&self, status: TicketStatus) -> DomainResult<Vec<Ticket>>;

    async fn list_by_spec(&self, spec_id: Uuid) -> DomainResult<Vec<Ticket>>;
}
