//! SQLite implementation of the guardian action repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::guardian::{ActionStatus, GuardianActionType};
use crate::domain::models::GuardianAction;
use crate::domain::ports::GuardianRepository;

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct GuardianRepositoryImpl {
    pool: SqlitePool,
}

impl GuardianRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_action(row: &sqlx::sqlite::SqliteRow) -> DomainResult<GuardianAction> {
        Ok(GuardianAction {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            action: GuardianActionType::from_str(&row.get::<String, _>("action")).ok_or_else(
                || {
                    DomainError::Serialization(format!(
                        "unknown guardian action {}",
                        row.get::<String, _>("action")
                    ))
                },
            )?,
            target_agent: parse_uuid_opt(row.get::<Option<String>, _>("target_agent").as_deref())?,
            target_task: parse_uuid_opt(row.get::<Option<String>, _>("target_task").as_deref())?,
            authority_level: row.get::<i64, _>("authority_level") as u8,
            reason: row.get("reason"),
            initiator: row.get("initiator"),
            approved_by: row.get("approved_by"),
            status: ActionStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown action status {}",
                    row.get::<String, _>("status")
                ))
            })?,
            executed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("executed_at").as_deref(),
            )?,
            reverted_at: parse_datetime_opt(
                row.get::<Option<String>, _>("reverted_at").as_deref(),
            )?,
            audit_log: parse_json(&row.get::<String, _>("audit_log"))?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }
}

#[async_trait]
impl GuardianRepository for GuardianRepositoryImpl {
    async fn create(&self, action: &GuardianAction) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO guardian_actions (
                id, action, target_agent, target_task, authority_level, reason,
                initiator, approved_by, status, executed_at, reverted_at,
                audit_log, created_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(action.id.to_string())
        .bind(action.action.as_str())
        .bind(action.target_agent.map(|id| id.to_string()))
        .bind(action.target_task.map(|id| id.to_string()))
        .bind(i64::from(action.authority_level))
        .bind(&action.reason)
        .bind(&action.initiator)
        .bind(action.approved_by.as_deref())
        .bind(action.status.as_str())
        .bind(action.executed_at.map(|d| d.to_rfc3339()))
        .bind(action.reverted_at.map(|d| d.to_rfc3339()))
        .bind(serde_json::to_string(&action.audit_log)?)
        .bind(action.created_at.to_rfc3339())
        .bind(action.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<GuardianAction>> {
        let row = sqlx::query("SELECT * FROM guardian_actions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_action).transpose()
    }

    async fn update(&self, action: &GuardianAction) -> DomainResult<()> {
        sqlx::query(
            "UPDATE guardian_actions SET
                approved_by = ?, status = ?, executed_at = ?, reverted_at = ?,
                audit_log = ?, version = ?
            WHERE id = ?",
        )
        .bind(action.approved_by.as_deref())
        .bind(action.status.as_str())
        .bind(action.executed_at.map(|d| d.to_rfc3339()))
        .bind(action.reverted_at.map(|d| d.to_rfc3339()))
        .bind(serde_json::to_string(&action.audit_log)?)
        .bind(action.version as i64)
        .bind(action.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_status(&self, status: ActionStatus) -> DomainResult<Vec<GuardianAction>> {
        let rows = sqlx::query(
            "SELECT * FROM guardian_actions WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_action).collect()
    }

    async fn list_for_agent(&self, agent_id: Uuid) -> DomainResult<Vec<GuardianAction>> {
        let rows = sqlx::query(
            "SELECT * FROM guardian_actions WHERE target_agent = ? ORDER BY created_at ASC",
        )
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_action).collect()
    }
}
