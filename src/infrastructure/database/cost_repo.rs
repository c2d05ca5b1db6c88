//! SQLite implementation of the cost record and budget repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::cost::{BudgetPeriod, BudgetScope};
use crate::domain::models::{Budget, CostRecord};
use crate::domain::ports::CostRepository;

use super::utils::{parse_datetime, parse_uuid, parse_uuid_opt};

pub struct CostRepositoryImpl {
    pool: SqlitePool,
}

impl CostRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> DomainResult<CostRecord> {
        Ok(CostRecord {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            task_id: parse_uuid(&row.get::<String, _>("task_id"))?,
            agent_id: parse_uuid_opt(row.get::<Option<String>, _>("agent_id").as_deref())?,
            provider: row.get("provider"),
            model: row.get("model"),
            prompt_tokens: row.get::<i64, _>("prompt_tokens") as u64,
            completion_tokens: row.get::<i64, _>("completion_tokens") as u64,
            prompt_cost: row.get("prompt_cost"),
            completion_cost: row.get("completion_cost"),
            total_cost: row.get("total_cost"),
            sandbox_id: row.get("sandbox_id"),
            billing_account: row.get("billing_account"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        })
    }

    fn row_to_budget(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Budget> {
        Ok(Budget {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            scope: BudgetScope::from_str(&row.get::<String, _>("scope")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown budget scope {}",
                    row.get::<String, _>("scope")
                ))
            })?,
            scope_id: row.get("scope_id"),
            limit_usd: row.get("limit_usd"),
            spent_usd: row.get("spent_usd"),
            reserved_usd: row.get("reserved_usd"),
            period: BudgetPeriod::from_str(&row.get::<String, _>("period")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown budget period {}",
                    row.get::<String, _>("period")
                ))
            })?,
            alert_threshold: row.get("alert_threshold"),
            period_started_at: parse_datetime(&row.get::<String, _>("period_started_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }
}

#[async_trait]
impl CostRepository for CostRepositoryImpl {
    async fn insert_record(&self, record: &CostRecord) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO cost_records (
                id, task_id, agent_id, provider, model, prompt_tokens,
                completion_tokens, prompt_cost, completion_cost, total_cost,
                sandbox_id, billing_account, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.task_id.to_string())
        .bind(record.agent_id.map(|id| id.to_string()))
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.prompt_tokens as i64)
        .bind(record.completion_tokens as i64)
        .bind(record.prompt_cost)
        .bind(record.completion_cost)
        .bind(record.total_cost)
        .bind(record.sandbox_id.as_deref())
        .bind(record.billing_account.as_deref())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_records_for_task(&self, task_id: Uuid) -> DomainResult<Vec<CostRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM cost_records WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn sum_costs(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        since: DateTime<Utc>,
    ) -> DomainResult<f64> {
        // Task scope sums directly; broader scopes sum over their column.
        let sql = match scope {
            BudgetScope::Task => {
                "SELECT COALESCE(SUM(total_cost), 0.0) FROM cost_records
                 WHERE task_id = ? AND created_at >= ?"
            }
            BudgetScope::Agent => {
                "SELECT COALESCE(SUM(total_cost), 0.0) FROM cost_records
                 WHERE agent_id = ? AND created_at >= ?"
            }
            BudgetScope::Project | BudgetScope::Account => {
                "SELECT COALESCE(SUM(total_cost), 0.0) FROM cost_records
                 WHERE billing_account = ? AND created_at >= ?"
            }
        };
        let row: (f64,) = sqlx::query_as(sql)
            .bind(scope_id)
            .bind(since.to_rfc3339())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn create_budget(&self, budget: &Budget) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO budgets (
                id, scope, scope_id, limit_usd, spent_usd, reserved_usd,
                period, alert_threshold, period_started_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(budget.id.to_string())
        .bind(budget.scope.as_str())
        .bind(&budget.scope_id)
        .bind(budget.limit_usd)
        .bind(budget.spent_usd)
        .bind(budget.reserved_usd)
        .bind(budget.period.as_str())
        .bind(budget.alert_threshold)
        .bind(budget.period_started_at.to_rfc3339())
        .bind(budget.updated_at.to_rfc3339())
        .bind(budget.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_budget(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> DomainResult<Option<Budget>> {
        let row = sqlx::query("SELECT * FROM budgets WHERE scope = ? AND scope_id = ?")
            .bind(scope.as_str())
            .bind(scope_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_budget).transpose()
    }

    async fn update_budget_with_version_check(
        &self,
        budget: &Budget,
        expected_version: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE budgets SET
                limit_usd = ?, spent_usd = ?, reserved_usd = ?, period = ?,
                alert_threshold = ?, period_started_at = ?, updated_at = ?,
                version = ?
            WHERE id = ? AND version = ?",
        )
        .bind(budget.limit_usd)
        .bind(budget.spent_usd)
        .bind(budget.reserved_usd)
        .bind(budget.period.as_str())
        .bind(budget.alert_threshold)
        .bind(budget.period_started_at.to_rfc3339())
        .bind(budget.updated_at.to_rfc3339())
        .bind(budget.version as i64)
        .bind(budget.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::StaleWrite {
                entity: "budget",
                id: budget.id.to_string(),
            });
        }
        Ok(())
    }
}
