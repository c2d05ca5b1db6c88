//! Cost record and budget repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Budget, BudgetScope, CostRecord};

#[async_trait]
pub trait CostRepository: Send + Sync {
    /// Append a cost record (append-only ledger).
    async fn insert_record(&self, record: &CostRecord) -> DomainResult<()>;

    async fn list_records_for_task(&self, task_id: Uuid) -> DomainResult<Vec<CostRecord>>;

    /// Sum of `total_cost` for a scope since `since`.
    async fn sum_costs(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> DomainResult<f64>;

    async fn create_budget(&self, budget: &Budget) -> DomainResult<()>;

    async fn get_budget(&self, scope: BudgetScope, scope_id: &str)
        -> DomainResult<Option<Budget>>;

    async fn update_budget_with_version_check(
        &self,
        budget: &Budget,
        expected_version: u64,
    ) -> DomainResult<()>;
}
