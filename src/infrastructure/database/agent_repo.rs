//! SQLite implementation of the agent and baseline repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentBaseline, AgentStatus};
use crate::domain::ports::AgentRepository;

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct AgentRepositoryImpl {
    pool: SqlitePool,
}

impl AgentRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Agent> {
        Ok(Agent {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            agent_type: row.get("agent_type"),
            status: AgentStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown agent status {}",
                    row.get::<String, _>("status")
                ))
            })?,
            capabilities: parse_json(&row.get::<String, _>("capabilities"))?,
            capacity: row.get::<i64, _>("capacity") as u32,
            current_task_id: parse_uuid_opt(
                row.get::<Option<String>, _>("current_task_id").as_deref(),
            )?,
            sandbox_id: row.get("sandbox_id"),
            health: parse_json(&row.get::<String, _>("health"))?,
            anomaly_score: row.get("anomaly_score"),
            consecutive_anomalous_readings: row.get::<i64, _>("consecutive_anomalous_readings")
                as u32,
            sequence_number: row.get::<i64, _>("sequence_number") as u64,
            last_expected_sequence: row.get::<i64, _>("last_expected_sequence") as u64,
            consecutive_missed_heartbeats: row.get::<i64, _>("consecutive_missed_heartbeats")
                as u32,
            corrupt_heartbeats: row.get::<i64, _>("corrupt_heartbeats") as u32,
            last_heartbeat_at: parse_datetime_opt(
                row.get::<Option<String>, _>("last_heartbeat_at").as_deref(),
            )?,
            failed_at: parse_datetime_opt(row.get::<Option<String>, _>("failed_at").as_deref())?,
            crypto_public_key: row.get("crypto_public_key"),
            metadata: parse_json(&row.get::<String, _>("metadata"))?,
            kept_alive_for_validation: row.get::<i64, _>("kept_alive_for_validation") != 0,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            version: row.get::<i64, _>("version") as u64,
        })
    }

    fn row_to_baseline(row: &sqlx::sqlite::SqliteRow) -> DomainResult<AgentBaseline> {
        Ok(AgentBaseline {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            agent_type: row.get("agent_type"),
            phase: row.get("phase"),
            latency_ms_mean: row.get("latency_ms_mean"),
            latency_ms_std: row.get("latency_ms_std"),
            error_rate: row.get("error_rate"),
            cpu_usage_percent: row.get("cpu_usage_percent"),
            memory_usage_mb: row.get("memory_usage_mb"),
            sample_count: row.get::<i64, _>("sample_count") as u64,
            last_updated: parse_datetime(&row.get::<String, _>("last_updated"))?,
        })
    }
}

#[async_trait]
impl AgentRepository for AgentRepositoryImpl {
    async fn create(&self, agent: &Agent) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO agents (
                id, name, agent_type, status, capabilities, capacity,
                current_task_id, sandbox_id, health, anomaly_score,
                consecutive_anomalous_readings, sequence_number,
                last_expected_sequence, consecutive_missed_heartbeats,
                corrupt_heartbeats, last_heartbeat_at, failed_at,
                crypto_public_key, metadata, kept_alive_for_validation,
                created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(agent.status.as_str())
        .bind(serde_json::to_string(&agent.capabilities)?)
        .bind(agent.capacity as i64)
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(agent.sandbox_id.as_deref())
        .bind(serde_json::to_string(&agent.health)?)
        .bind(agent.anomaly_score)
        .bind(agent.consecutive_anomalous_readings as i64)
        .bind(agent.sequence_number as i64)
        .bind(agent.last_expected_sequence as i64)
        .bind(agent.consecutive_missed_heartbeats as i64)
        .bind(agent.corrupt_heartbeats as i64)
        .bind(agent.last_heartbeat_at.map(|d| d.to_rfc3339()))
        .bind(agent.failed_at.map(|d| d.to_rfc3339()))
        .bind(agent.crypto_public_key.as_deref())
        .bind(serde_json::to_string(&agent.metadata)?)
        .bind(i64::from(agent.kept_alive_for_validation))
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .bind(agent.version as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn update_with_version_check(
        &self,
        agent: &Agent,
        expected_version: u64,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE agents SET
                name = ?, agent_type = ?, status = ?, capabilities = ?,
                capacity = ?, current_task_id = ?, sandbox_id = ?, health = ?,
                anomaly_score = ?, consecutive_anomalous_readings = ?,
                sequence_number = ?, last_expected_sequence = ?,
                consecutive_missed_heartbeats = ?, corrupt_heartbeats = ?,
                last_heartbeat_at = ?, failed_at = ?, crypto_public_key = ?,
                metadata = ?, kept_alive_for_validation = ?, updated_at = ?,
                version = ?
            WHERE id = ? AND version = ?",
        )
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(agent.status.as_str())
        .bind(serde_json::to_string(&agent.capabilities)?)
        .bind(agent.capacity as i64)
        .bind(agent.current_task_id.map(|id| id.to_string()))
        .bind(agent.sandbox_id.as_deref())
        .bind(serde_json::to_string(&agent.health)?)
        .bind(agent.anomaly_score)
        .bind(agent.consecutive_anomalous_readings as i64)
        .bind(agent.sequence_number as i64)
        .bind(agent.last_expected_sequence as i64)
        .bind(agent.consecutive_missed_heartbeats as i64)
        .bind(agent.corrupt_heartbeats as i64)
        .bind(agent.last_heartbeat_at.map(|d| d.to_rfc3339()))
        .bind(agent.failed_at.map(|d| d.to_rfc3339()))
        .bind(agent.crypto_public_key.as_deref())
        .bind(serde_json::to_string(&agent.metadata)?)
        .bind(i64::from(agent.kept_alive_for_validation))
        .bind(agent.updated_at.to_rfc3339())
        .bind(agent.version as i64)
        .bind(agent.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get(agent.id).await?.is_none() {
                return Err(DomainError::AgentNotFound(agent.id));
            }
            return Err(DomainError::StaleWrite {
                entity: "agent",
                id: agent.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_by_status(&self, status: AgentStatus) -> DomainResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn list_live(&self) -> DomainResult<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE status != 'TERMINATED' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn get_baseline(
        &self,
        agent_type: &str,
        phase: Option<&str>,
    ) -> DomainResult<Option<AgentBaseline>> {
        let row = sqlx::query(
            "SELECT * FROM agent_baselines WHERE agent_type = ? AND phase IS ?",
        )
        .bind(agent_type)
        .bind(phase)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_baseline).transpose()
    }

    async fn upsert_baseline(&self, baseline: &AgentBaseline) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO agent_baselines (
                id, agent_type, phase, latency_ms_mean, latency_ms_std,
                error_rate, cpu_usage_percent, memory_usage_mb, sample_count,
                last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_type, phase) DO UPDATE SET
                latency_ms_mean = excluded.latency_ms_mean,
                latency_ms_std = excluded.latency_ms_std,
                error_rate = excluded.error_rate,
                cpu_usage_percent = excluded.cpu_usage_percent,
                memory_usage_mb = excluded.memory_usage_mb,
                sample_count = excluded.sample_count,
                last_updated = excluded.last_updated",
        )
        .bind(baseline.id.to_string())
        .bind(&baseline.agent_type)
        .bind(baseline.phase.as_deref())
        .bind(baseline.latency_ms_mean)
        .bind(baseline.latency_ms_std)
        .bind(baseline.error_rate)
        .bind(baseline.cpu_usage_percent)
        .bind(baseline.memory_usage_mb)
        .bind(baseline.sample_count as i64)
        .bind(baseline.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::HealthMetrics;
    use crate::infrastructure::database::connection::DatabaseConnection;

    async fn repo() -> AgentRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        AgentRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let repo = repo().await;
        let agent = Agent::new("worker-1", "coder")
            .with_capabilities(vec!["rust".to_string()])
            .with_sandbox("sb-1");
        repo.create(&agent).await.unwrap();

        let loaded = repo.get(agent.id).await.unwrap().unwrap();
        assert_eq!(loaded, agent);
    }

    #[tokio::test]
    async fn test_stale_write_detected() {
        let repo = repo().await;
        let mut agent = Agent::new("worker-1", "coder");
        repo.create(&agent).await.unwrap();

        agent.transition_to(AgentStatus::Idle).unwrap();
        repo.update_with_version_check(&agent, agent.version - 1)
            .await
            .unwrap();
        let err = repo
            .update_with_version_check(&agent, agent.version - 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn test_list_live_excludes_terminated() {
        let repo = repo().await;
        let mut terminated = Agent::new("dead", "coder");
        repo.create(&terminated).await.unwrap();
        terminated.transition_to(AgentStatus::Terminated).unwrap();
        repo.update_with_version_check(&terminated, terminated.version - 1)
            .await
            .unwrap();

        let alive = Agent::new("alive", "coder");
        repo.create(&alive).await.unwrap();

        let live = repo.list_live().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, alive.id);
    }

    #[tokio::test]
    async fn test_baseline_upsert() {
        let repo = repo().await;
        let mut baseline = AgentBaseline::new("coder", None);
        baseline.observe(&HealthMetrics {
            avg_latency_ms: 100.0,
            ..Default::default()
        });
        repo.upsert_baseline(&baseline).await.unwrap();

        baseline.observe(&HealthMetrics {
            avg_latency_ms: 150.0,
            ..Default::default()
        });
        repo.upsert_baseline(&baseline).await.unwrap();

        let loaded = repo.get_baseline("coder", None).await.unwrap().unwrap();
        assert_eq!(loaded.sample_count, 2);
        assert!(repo.get_baseline("coder", Some("explore")).await.unwrap().is_none());
    }
}
