//! Merge attempt repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::MergeAttempt;

#[async_trait]
pub trait MergeRepository: Send + Sync {
    async fn create(&self, attempt: &MergeAttempt) -> DomainResult<()>;

    async fn update(&self, attempt: &MergeAttempt) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<MergeAttempt>>;

    async fn list_for_task(&self, task_id: Uuid) -> DomainResult<Vec<MergeAttempt>>;
}
