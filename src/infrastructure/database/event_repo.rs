//! SQLite implementation of the sandbox event repository and the
//! event-bus persistence sink.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EntityType, EventEnvelope, EventSource, SandboxEvent};
use crate::domain::ports::EventRepository;
use crate::services::event_bus::EventSink;

use super::utils::{parse_datetime, parse_json, parse_uuid, parse_uuid_opt};

pub struct EventRepositoryImpl {
    pool: SqlitePool,
}

impl EventRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> DomainResult<SandboxEvent> {
        Ok(SandboxEvent {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            sandbox_id: row.get("sandbox_id"),
            event_type: row.get("event_type"),
            event_data: parse_json(&row.get::<String, _>("event_data"))?,
            source: EventSource::from_str(&row.get::<String, _>("source")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown event source {}",
                    row.get::<String, _>("source")
                ))
            })?,
            spec_id: parse_uuid_opt(row.get::<Option<String>, _>("spec_id").as_deref())?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        })
    }
}

#[async_trait]
impl EventRepository for EventRepositoryImpl {
    async fn append(&self, event: &SandboxEvent) -> DomainResult<bool> {
        // INSERT OR IGNORE keeps replays idempotent by primary key.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sandbox_events (
                id, sandbox_id, event_type, event_data, source, spec_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(&event.sandbox_id)
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.event_data)?)
        .bind(event.source.as_str())
        .bind(event.spec_id.map(|id| id.to_string()))
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_sandbox(
        &self,
        sandbox_id: &str,
        limit: usize,
    ) -> DomainResult<Vec<SandboxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM sandbox_events WHERE sandbox_id = ?
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(sandbox_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn list_by_spec(&self, spec_id: Uuid, limit: usize) -> DomainResult<Vec<SandboxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM sandbox_events WHERE spec_id = ?
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(spec_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn count_by_sandbox(&self, sandbox_id: &str) -> DomainResult<u64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sandbox_events WHERE sandbox_id = ?")
                .bind(sandbox_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 as u64)
    }
}

/// Durable sink for the in-process event bus. Persisted before fan-out so
/// replay from `bus_events` is authoritative.
pub struct BusEventSink {
    pool: SqlitePool,
}

impl BusEventSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replay persisted envelopes for one entity, in publish order.
    pub async fn replay(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DomainResult<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            "SELECT * FROM bus_events WHERE entity_type = ? AND entity_id = ?
             ORDER BY at ASC, id ASC",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EventEnvelope {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    event_type: row.get("event_type"),
                    entity_type,
                    entity_id: row.get("entity_id"),
                    payload: parse_json(&row.get::<String, _>("payload"))?,
                    at: parse_datetime(&row.get::<String, _>("at"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for BusEventSink {
    async fn persist(&self, event: &EventEnvelope) -> DomainResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO bus_events (id, event_type, entity_type, entity_id, payload, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(&event.event_type)
        .bind(event.entity_type.as_str())
        .bind(&event.entity_id)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
