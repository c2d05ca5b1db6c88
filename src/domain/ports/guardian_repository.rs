//! Guardian action repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ActionStatus, GuardianAction};

#[async_trait]
pub trait GuardianRepository: Send + Sync {
    async fn create(&self, action: &GuardianAction) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<GuardianAction>>;

    async fn update(&self, action: &GuardianAction) -> DomainResult<()>;

    async fn list_by_status(&self, status: ActionStatus) -> DomainResult<Vec<GuardianAction>>;

    async fn list_for_agent(&self, agent_id: Uuid) -> DomainResult<Vec<GuardianAction>>;
}
