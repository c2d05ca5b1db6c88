//! SQLite implementation of the merge attempt repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::merge::MergeStatus;
use crate::domain::models::MergeAttempt;
use crate::domain::ports::MergeRepository;

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct MergeRepositoryImpl {
    pool: SqlitePool,
}

impl MergeRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> DomainResult<MergeAttempt> {
        Ok(MergeAttempt {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            task_id: parse_uuid(&row.get::<String, _>("task_id"))?,
            ticket_id: parse_uuid_opt(row.get::<Option<String>, _>("ticket_id").as_deref())?,
            source_task_ids: parse_json(&row.get::<String, _>("source_task_ids"))?,
            incoming_branches: parse_json(&row.get::<String, _>("incoming_branches"))?,
            target_branch: row.get("target_branch"),
            merge_order: parse_json(&row.get::<String, _>("merge_order"))?,
            conflict_scores: parse_json(&row.get::<String, _>("conflict_scores"))?,
            status: MergeStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown merge status {}",
                    row.get::<String, _>("status")
                ))
            })?,
            llm_invocations: row.get::<i64, _>("llm_invocations") as u32,
            tokens_spent: row.get::<i64, _>("tokens_spent") as u64,
            cost_usd: row.get("cost_usd"),
            outcome: row.get("outcome"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            completed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("completed_at").as_deref(),
            )?,
        })
    }
}

#[async_trait]
impl MergeRepository for MergeRepositoryImpl {
    async fn create(&self, attempt: &MergeAttempt) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO merge_attempts (
                id, task_id, ticket_id, source_task_ids, incoming_branches,
                target_branch, merge_order, conflict_scores, status,
                llm_invocations, tokens_spent, cost_usd, outcome, created_at,
                completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id.to_string())
        .bind(attempt.task_id.to_string())
        .bind(attempt.ticket_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&attempt.source_task_ids)?)
        .bind(serde_json::to_string(&attempt.incoming_branches)?)
        .bind(&attempt.target_branch)
        .bind(serde_json::to_string(&attempt.merge_order)?)
        .bind(serde_json::to_string(&attempt.conflict_scores)?)
        .bind(attempt.status.as_str())
        .bind(i64::from(attempt.llm_invocations))
        .bind(attempt.tokens_spent as i64)
        .bind(attempt.cost_usd)
        .bind(attempt.outcome.as_deref())
        .bind(attempt.created_at.to_rfc3339())
        .bind(attempt.completed_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, attempt: &MergeAttempt) -> DomainResult<()> {
        sqlx::query(
            "UPDATE merge_attempts SET
                merge_order = ?, conflict_scores = ?, status = ?,
                llm_invocations = ?, tokens_spent = ?, cost_usd = ?,
                outcome = ?, completed_at = ?
            WHERE id = ?",
        )
        .bind(serde_json::to_string(&attempt.merge_order)?)
        .bind(serde_json::to_string(&attempt.conflict_scores)?)
        .bind(attempt.status.as_str())
        .bind(i64::from(attempt.llm_invocations))
        .bind(attempt.tokens_spent as i64)
        .bind(attempt.cost_usd)
        .bind(attempt.outcome.as_deref())
        .bind(attempt.completed_at.map(|d| d.to_rfc3339()))
        .bind(attempt.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<MergeAttempt>> {
        let row = sqlx::query("SELECT * FROM merge_attempts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_attempt).transpose()
    }

    async fn list_for_task(&self, task_id: Uuid) -> DomainResult<Vec<MergeAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM merge_attempts WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::connection::DatabaseConnection;

    #[tokio::test]
    async fn test_round_trip() {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let repo = MergeRepositoryImpl::new(db.pool().clone());

        let mut attempt = MergeAttempt::new(Uuid::new_v4(), "main");
        let source = Uuid::new_v4();
        attempt.source_task_ids.push(source);
        attempt.record_score(source, 2);
        attempt.record_resolution(1000, 0.01);
        repo.create(&attempt).await.unwrap();

        attempt.finish(MergeStatus::Succeeded, Some("merged".into()));
        repo.update(&attempt).await.unwrap();

        let loaded = repo.get(attempt.id).await.unwrap().unwrap();
        assert_eq!(loaded, attempt);
        assert_eq!(repo.list_for_task(attempt.task_id).await.unwrap().len(), 1);
    }
}
