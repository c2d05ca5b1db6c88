//! SQLite implementation of the spec repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Spec, SpecPhase};
use crate::domain::ports::SpecRepository;

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct SpecRepositoryImpl {
    pool: SqlitePool,
}

impl SpecRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_spec(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Spec> {
        Ok(Spec {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            title: row.get("title"),
            description: row.get("description"),
            current_phase: SpecPhase::from_str(&row.get::<String, _>("current_phase"))
                .ok_or_else(|| {
                    DomainError::Serialization(format!(
                        "unknown spec phase {}",
                        row.get::<String, _>("current_phase")
                    ))
                })?,
            phase_data: parse_json(&row.get::<String, _>("phase_data"))?,
            session_transcripts: parse_json(&row.get::<String, _>("session_transcripts"))?,
            phase_attempts: parse_json(&row.get::<String, _>("phase_attempts"))?,
            last_checkpoint_at: parse_datetime_opt(
                row.get::<Option<String>, _>("last_checkpoint_at").as_deref(),
            )?,
            last_error: row.get("last_error"),
            share_token: row.get("share_token"),
            archived: row.get::<i64, _>("archived") != 0,
            user_id: parse_uuid_opt(row.get::<Option<String>, _>("user_id").as_deref())?,
            project_id: parse_uuid_opt(row.get::<Option<String>, _>("project_id").as_deref())?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }
}

#[async_trait]
impl SpecRepository for SpecRepositoryImpl {
    async fn create(&self, spec: &Spec) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO specs (
                id, title, description, current_phase, phase_data,
                session_transcripts, phase_attempts, last_checkpoint_at,
                last_error, share_token, archived, user_id, project_id,
                created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(spec.id.to_string())
        .bind(&spec.title)
        .bind(&spec.description)
        .bind(spec.current_phase.as_str())
        .bind(serde_json::to_string(&spec.phase_data)?)
        .bind(serde_json::to_string(&spec.session_transcripts)?)
        .bind(serde_json::to_string(&spec.phase_attempts)?)
        .bind(spec.last_checkpoint_at.map(|d| d.to_rfc3339()))
        .bind(spec.last_error.as_deref())
        .bind(spec.share_token.as_deref())
        .bind(i64::from(spec.archived))
        .bind(spec.user_id.map(|id| id.to_string()))
        .bind(spec.project_id.map(|id| id.to_string()))
        .bind(spec.created_at.to_rfc3339())
        .bind(spec.updated_at.to_rfc3339())
        .bind(spec.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Spec>> {
        let row = sqlx::query("SELECT * FROM specs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_spec).transpose()
    }

    async fn update_with_version_check(
        &self,
        spec: &Spec,
        expected_version: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE specs SET
                title = ?, description = ?, current_phase = ?, phase_data = ?,
                session_transcripts = ?, phase_attempts = ?,
                last_checkpoint_at = ?, last_error = ?, share_token = ?,
                archived = ?, user_id = ?, project_id = ?, updated_at = ?,
                version = ?
            WHERE id = ? AND version = ?",
        )
        .bind(&spec.title)
        .bind(&spec.description)
        .bind(spec.current_phase.as_str())
        .bind(serde_json::to_string(&spec.phase_data)?)
        .bind(serde_json::to_string(&spec.session_transcripts)?)
        .bind(serde_json::to_string(&spec.phase_attempts)?)
        .bind(spec.last_checkpoint_at.map(|d| d.to_rfc3339()))
        .bind(spec.last_error.as_deref())
        .bind(spec.share_token.as_deref())
        .bind(i64::from(spec.archived))
        .bind(spec.user_id.map(|id| id.to_string()))
        .bind(spec.project_id.map(|id| id.to_string()))
        .bind(spec.updated_at.to_rfc3339())
        .bind(spec.version as i64)
        .bind(spec.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get(spec.id).await?.is_none() {
                return Err(DomainError::SpecNotFound(spec.id));
            }
            return Err(DomainError::StaleWrite {
                entity: "spec",
                id: spec.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_active(&self) -> DomainResult<Vec<Spec>> {
        let rows = sqlx::query(
            "SELECT * FROM specs WHERE archived = 0 AND current_phase != 'complete'
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::connection::DatabaseConnection;
    use serde_json::json;

    async fn repo() -> SpecRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        SpecRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_round_trip_with_phase_maps() {
        let repo = repo().await;
        let mut spec = Spec::new("Search", "Add search");
        spec.complete_phase(SpecPhase::Explore, json!({"files": 3}), Some("dHJh".into()))
            .unwrap();
        spec.record_attempt(SpecPhase::Requirements, Some("thin".into()));
        repo.create(&spec).await.unwrap();

        let loaded = repo.get(spec.id).await.unwrap().unwrap();
        assert_eq!(loaded, spec);
        assert_eq!(loaded.current_phase, SpecPhase::Requirements);
        assert_eq!(loaded.attempts_for(SpecPhase::Requirements), 1);
    }

    #[tokio::test]
    async fn test_list_active_excludes_complete_and_archived() {
        let repo = repo().await;
        let active = Spec::new("a", "d");
        repo.create(&active).await.unwrap();

        let mut archived = Spec::new("b", "d");
        archived.archived = true;
        repo.create(&archived).await.unwrap();

        let mut complete = Spec::new("c", "d");
        for phase in SpecPhase::WORKFLOW {
            complete.complete_phase(phase, json!({}), None).unwrap();
        }
        repo.create(&complete).await.unwrap();

        let listed = repo.list_active().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }
}
