//! Spec repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Spec;

#[async_trait]
pub trait SpecRepository: Send + Sync {
    async fn create(&self, spec: &Spec) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Spec>>;

    async fn update_with_version_check(
        &self,
        spec: &Spec,
        expected_version: u64,
    ) -> DomainResult<()>;

    async fn list_active(&self) -> DomainResult<Vec<Spec>>;
}
