//! SQLite implementation of the sandbox resource allocation repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::SandboxResourceAllocation;
use crate::domain::ports::AllocationRepository;

use super::utils::{parse_datetime, parse_json};

pub struct AllocationRepositoryImpl {
    pool: SqlitePool,
}

impl AllocationRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_allocation(
        row: &sqlx::sqlite::SqliteRow,
    ) -> DomainResult<SandboxResourceAllocation> {
        Ok(SandboxResourceAllocation {
            sandbox_id: row.get("sandbox_id"),
            current: parse_json(&row.get::<String, _>("current_envelope"))?,
            pending: row
                .get::<Option<String>, _>("pending_envelope")
                .as_deref()
                .map(parse_json)
                .transpose()?,
            updated_by: row.get("updated_by"),
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }
}

#[async_trait]
impl AllocationRepository for AllocationRepositoryImpl {
    async fn upsert(&self, allocation: &SandboxResourceAllocation) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO sandbox_resource_allocations (
                sandbox_id, current_envelope, pending_envelope, updated_by,
                updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(sandbox_id) DO UPDATE SET
                current_envelope = excluded.current_envelope,
                pending_envelope = excluded.pending_envelope,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at,
                version = excluded.version",
        )
        .bind(&allocation.sandbox_id)
        .bind(serde_json::to_string(&allocation.current)?)
        .bind(
            allocation
                .pending
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&allocation.updated_by)
        .bind(allocation.updated_at.to_rfc3339())
        .bind(allocation.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, sandbox_id: &str) -> DomainResult<Option<SandboxResourceAllocation>> {
        let row = sqlx::query("SELECT * FROM sandbox_resource_allocations WHERE sandbox_id = ?")
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_allocation).transpose()
    }

    async fn update_with_version_check(
        &self,
        allocation: &SandboxResourceAllocation,
        expected_version: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE sandbox_resource_allocations SET
                current_envelope = ?, pending_envelope = ?, updated_by = ?,
                updated_at = ?, version = ?
            WHERE sandbox_id = ? AND version = ?",
        )
        .bind(serde_json::to_string(&allocation.current)?)
        .bind(
            allocation
                .pending
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&allocation.updated_by)
        .bind(allocation.updated_at.to_rfc3339())
        .bind(allocation.version as i64)
        .bind(&allocation.sandbox_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::StaleWrite {
                entity: "sandbox_resource_allocation",
                id: allocation.sandbox_id.clone(),
            });
        }
        Ok(())
    }
}
