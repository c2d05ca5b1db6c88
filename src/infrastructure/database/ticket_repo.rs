//! SQLite implementation of the ticket repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ticket::{ApprovalStatus, TicketStatus};
use crate::domain::models::Ticket;
use crate::domain::ports::TicketRepository;

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct TicketRepositoryImpl {
    pool: SqlitePool,
}

impl TicketRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_ticket(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Ticket> {
        Ok(Ticket {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            title: row.get("title"),
            description: row.get("description"),
            phase: row.get("phase"),
            status: TicketStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown ticket status {}",
                    row.get::<String, _>("status")
                ))
            })?,
            approval_status: ApprovalStatus::from_str(&row.get::<String, _>("approval_status"))
                .ok_or_else(|| {
                    DomainError::Serialization(format!(
                        "unknown approval status {}",
                        row.get::<String, _>("approval_status")
                    ))
                })?,
            priority: row.get("priority"),
            deadline: parse_datetime_opt(row.get::<Option<String>, _>("deadline").as_deref())?,
            is_blocked: row.get::<i64, _>("is_blocked") != 0,
            blocked_reason: row.get("blocked_reason"),
            project_id: parse_uuid_opt(row.get::<Option<String>, _>("project_id").as_deref())?,
            user_id: parse_uuid_opt(row.get::<Option<String>, _>("user_id").as_deref())?,
            spec_id: parse_uuid_opt(row.get::<Option<String>, _>("spec_id").as_deref())?,
            dependencies: parse_json(&row.get::<String, _>("dependencies"))?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }
}

#[async_trait]
impl TicketRepository for TicketRepositoryImpl {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO tickets (
                id, title, description, phase, status, approval_status,
                priority, deadline, is_blocked, blocked_reason, project_id,
                user_id, spec_id, dependencies, created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ticket.id.to_string())
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(ticket.phase.as_deref())
        .bind(ticket.status.as_str())
        .bind(ticket.approval_status.as_str())
        .bind(ticket.priority)
        .bind(ticket.deadline.map(|d| d.to_rfc3339()))
        .bind(i64::from(ticket.is_blocked))
        .bind(ticket.blocked_reason.as_deref())
        .bind(ticket.project_id.map(|id| id.to_string()))
        .bind(ticket.user_id.map(|id| id.to_string()))
        .bind(ticket.spec_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&ticket.dependencies)?)
        .bind(ticket.created_at.to_rfc3339())
        .bind(ticket.updated_at.to_rfc3339())
        .bind(ticket.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>> {
        let row = sqlx::query("SELECT * FROM tickets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_ticket).transpose()
    }

    async fn update_with_version_check(
        &self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE tickets SET
                title = ?, description = ?, phase = ?, status = ?,
                approval_status = ?, priority = ?, deadline = ?, is_blocked = ?,
                blocked_reason = ?, project_id = ?, user_id = ?, spec_id = ?,
                dependencies = ?, updated_at = ?, version = ?
            WHERE id = ? AND version = ?",
        )
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(ticket.phase.as_deref())
        .bind(ticket.status.as_str())
        .bind(ticket.approval_status.as_str())
        .bind(ticket.priority)
        .bind(ticket.deadline.map(|d| d.to_rfc3339()))
        .bind(i64::from(ticket.is_blocked))
        .bind(ticket.blocked_reason.as_deref())
        .bind(ticket.project_id.map(|id| id.to_string()))
        .bind(ticket.user_id.map(|id| id.to_string()))
        .bind(ticket.spec_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&ticket.dependencies)?)
        .bind(ticket.updated_at.to_rfc3339())
        .bind(ticket.version as i64)
        .bind(ticket.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get(ticket.id).await?.is_none() {
                return Err(DomainError::TicketNotFound(ticket.id));
            }
            return Err(DomainError::StaleWrite {
                entity: "ticket",
                id: ticket.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_by_status(&self, status: TicketStatus) -> DomainResult<Vec<Ticket>> {
        let rows = sqlx::query("SELECT * FROM tickets WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_ticket).collect()
    }

    async fn list_by_spec(&self, spec_id: Uuid) -> DomainResult<Vec<Ticket>> {
        let rows = sqlx::query("SELECT * FROM tickets WHERE spec_id = ? ORDER BY created_at ASC")
            .bind(spec_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_ticket).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::connection::DatabaseConnection;

    async fn repo() -> TicketRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        TicketRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let repo = repo().await;
        let mut ticket = Ticket::new("Add search", "Full-text search");
        ticket.dependencies.blocked_by.push(Uuid::new_v4());
        repo.create(&ticket).await.unwrap();

        let loaded = repo.get(ticket.id).await.unwrap().unwrap();
        assert_eq!(loaded, ticket);
    }

    #[tokio::test]
    async fn test_approval_survives_persistence() {
        let repo = repo().await;
        let mut ticket = Ticket::new("t", "d");
        repo.create(&ticket).await.unwrap();

        ticket.approve().unwrap();
        repo.update_with_version_check(&ticket, ticket.version - 1)
            .await
            .unwrap();

        let loaded = repo.get(ticket.id).await.unwrap().unwrap();
        assert!(loaded.is_schedulable());
    }
}
