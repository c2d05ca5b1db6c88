//! Sandbox resource allocation repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::SandboxResourceAllocation;

#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn upsert(&self, allocation: &SandboxResourceAllocation) -> DomainResult<()>;

    async fn get(&self, sandbox_id: &str) -> DomainResult<Option<SandboxResourceAllocation>>;

    async fn update_with_version_check(
        &self,
        allocation: &SandboxResourceAllocation,
        expected_version: u64,
    ) -> DomainResult<()>;
}
