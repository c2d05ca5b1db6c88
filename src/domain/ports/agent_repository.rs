//! Agent and baseline repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Agent, AgentBaseline, AgentStatus};

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: &Agent) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>>;

    async fn update_with_version_check(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> DomainResult<()>;

    async fn list_by_status(&self, status: AgentStatus) -> DomainResult<Vec<Agent>>;

    /// All agents not yet terminated, for the overdue-heartbeat sweep.
    async fn list_live(&self) -> DomainResult<Vec<Agent>>;

    /// Rolling baseline for an (agent_type, phase) pair.
    async fn get_baseline(
        &self,
        agent_type: &str,
        phase: Option<&str>,
    ) -> DomainResult<Option<AgentBaseline>>;

    /// Insert or replace a baseline row.
    async fn upsert_baseline(&self, baseline: &AgentBaseline) -> DomainResult<()>;
}
