//! Heartbeat protocol engine and anomaly detection.
//!
//! Verifies checksums, applies strictly-increasing sequence numbers,
//! accounts gaps, advances the agent state machine along the escalation
//! ladder, and maintains rolling per-(agent_type, phase) baselines with
//! a capped additive anomaly composite.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::HeartbeatConfig;
use crate::domain::models::{
    Agent, AgentBaseline, AgentStatus, EntityType, EventEnvelope, HealthMetrics, HeartbeatAck,
    HeartbeatMessage,
};
use crate::domain::ports::AgentRepository;
use crate::services::event_bus::EventBus;

/// Weights of the anomaly composite. Additive with per-component caps so
/// no single signal can alone force quarantine.
#[derive(Debug, Clone)]
pub struct AnomalyWeights {
    pub latency: f64,
    pub error_rate: f64,
    pub cpu_skew: f64,
    pub memory_skew: f64,
    pub queue_impact: f64,
    /// Queue depth considered fully saturated
    pub queue_cap: f64,
}

impl Default for AnomalyWeights {
    fn default() -> Self {
        Self {
            latency: 0.30,
            error_rate: 0.25,
            cpu_skew: 0.15,
            memory_skew: 0.15,
            queue_impact: 0.15,
            queue_cap: 50.0,
        }
    }
}

impl AnomalyWeights {
    /// Composite anomaly score in [0, 1]. Each component is clamped to
    /// [0, 1] before weighting.
    pub fn score(&self, baseline: &AgentBaseline, metrics: &HealthMetrics) -> f64 {
        let latency_component = (baseline.latency_z(metrics.avg_latency_ms) / 3.0).clamp(0.0, 1.0);

        let error_component = if baseline.error_rate > f64::EPSILON {
            (metrics.error_rate / (baseline.error_rate * 4.0)).clamp(0.0, 1.0)
        } else {
            (metrics.error_rate * 10.0).clamp(0.0, 1.0)
        };

        let cpu_component = skew(metrics.cpu_usage_percent, baseline.cpu_usage_percent);
        let memory_component = skew(metrics.memory_usage_mb, baseline.memory_usage_mb);
        let queue_component = (f64::from(metrics.queue_depth) / self.queue_cap).clamp(0.0, 1.0);

        (self.latency * latency_component
            + self.error_rate * error_component
            + self.cpu_skew * cpu_component
            + self.memory_skew * memory_component
            + self.queue_impact * queue_component)
            .clamp(0.0, 1.0)
    }
}

/// Relative deviation above baseline, clamped to [0, 1]. Twice the
/// baseline counts as fully skewed.
fn skew(observed: f64, baseline: f64) -> f64 {
    if baseline <= f64::EPSILON {
        return 0.0;
    }
    ((observed - baseline) / baseline).clamp(0.0, 1.0)
}

/// Outcome of applying the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Warn,
    Degrade,
    Guardian,
    Fail,
}

/// The heartbeat & anomaly engine (C3).
pub struct HeartbeatMonitor {
    agent_repo: Arc<dyn AgentRepository>,
    bus: Arc<EventBus>,
    config: HeartbeatConfig,
    weights: AnomalyWeights,
}

impl HeartbeatMonitor {
    pub fn new(
        agent_repo: Arc<dyn AgentRepository>,
        bus: Arc<EventBus>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            agent_repo,
            bus,
            config,
            weights: AnomalyWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: AnomalyWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Process one heartbeat and produce the acknowledgment.
    pub async fn handle_heartbeat(
        &self,
        message: HeartbeatMessage,
    ) -> DomainResult<HeartbeatAck> {
        let Some(mut agent) = self.agent_repo.get(message.agent_id).await? else {
            return Err(DomainError::AgentNotFound(message.agent_id));
        };

        // 1. Checksum: corrupt messages are counted and dropped.
        if !message.verify_checksum() {
            agent.corrupt_heartbeats += 1;
            agent.updated_at = Utc::now();
            agent.version += 1;
            self.persist(&mut agent).await?;
            warn!(agent_id = %agent.id, "heartbeat checksum mismatch, dropped");
            return Err(DomainError::ChecksumMismatch(agent.id));
        }

        // 2. Replay: acknowledged but not applied.
        if message.sequence_number <= agent.sequence_number {
            debug!(
                agent_id = %agent.id,
                sequence = message.sequence_number,
                last_accepted = agent.sequence_number,
                "heartbeat replay discarded"
            );
            return Ok(
                HeartbeatAck::received(agent.id, message.sequence_number)
                    .with_message("replay: already applied"),
            );
        }

        // 3. Gap accounting against the expected sequence.
        let gap = message.sequence_number.saturating_sub(agent.last_expected_sequence);
        let mut ack = HeartbeatAck::received(agent.id, message.sequence_number);
        if gap > 0 {
            agent.consecutive_missed_heartbeats += gap as u32;
            ack = ack.with_message(format!("gap of {gap} heartbeats detected"));
        } else {
            agent.consecutive_missed_heartbeats = 0;
        }

        // 4. Apply the reading.
        agent.sequence_number = message.sequence_number;
        agent.last_expected_sequence = message.sequence_number + 1;
        agent.last_heartbeat_at = Some(message.timestamp);
        agent.current_task_id = message.current_task_id;
        agent.health = message.metrics.clone();

        // 5. Baselines and anomaly composite.
        self.update_anomaly(&mut agent, &message.metrics).await?;

        let missed = agent.consecutive_missed_heartbeats;
        agent.updated_at = Utc::now();
        agent.version += 1;
        self.persist(&mut agent).await?;

        // Gaps feed the same ladder as silence.
        if missed > 0 {
            self.escalate(agent.id, missed).await?;
        }

        Ok(ack)
    }

    /// Sweep live agents for heartbeat silence; called periodically.
    ///
    /// `now` is injected so tests can step time without sleeping.
    pub async fn check_overdue(&self, now: DateTime<Utc>) -> DomainResult<Vec<(uuid::Uuid, Escalation)>> {
        let interval = Duration::seconds(self.config.interval_secs as i64);
        let mut outcomes = Vec::new();

        for mut agent in self.agent_repo.list_live().await? {
            if matches!(agent.status, AgentStatus::Spawning | AgentStatus::Quarantined) {
                continue;
            }

            // Grace window after FAILED: recoverable agents quarantine.
            if agent.status == AgentStatus::Failed {
                if let Some(failed_at) = agent.failed_at {
                    if now - failed_at
                        > Duration::seconds(self.config.recovery_grace_secs as i64)
                    {
                        agent.transition_to(AgentStatus::Quarantined)?;
                        self.persist(&mut agent).await?;
                        self.publish_agent_event(agent.id, "agent.quarantined", json!({
                            "reason": "recovery_grace_expired",
                        }))
                        .await;
                    }
                }
                continue;
            }

            let anchor = agent.last_heartbeat_at.unwrap_or(agent.created_at);
            let elapsed = now - anchor;
            if elapsed <= interval {
                continue;
            }

            let missed = (elapsed.num_seconds() / interval.num_seconds()).max(0) as u32;
            if missed == 0 {
                continue;
            }

            agent.consecutive_missed_heartbeats = missed;
            agent.updated_at = Utc::now();
            agent.version += 1;
            self.persist(&mut agent).await?;

            let escalation = self.escalate(agent.id, missed).await?;
            outcomes.push((agent.id, escalation));
        }

        Ok(outcomes)
    }

    /// Apply the escalation ladder for a missed/anomalous count:
    /// 1 → warn; 2–3 → DEGRADED; 4–5 → guardian; ≥6 → FAILED.
    async fn escalate(&self, agent_id: uuid::Uuid, count: u32) -> DomainResult<Escalation> {
        let Some(mut agent) = self.agent_repo.get(agent_id).await? else {
            return Err(DomainError::AgentNotFound(agent_id));
        };

        let escalation = if count >= self.config.fail_after {
            Escalation::Fail
        } else if count >= self.config.guardian_after {
            Escalation::Guardian
        } else if count >= self.config.degrade_after {
            Escalation::Degrade
        } else if count >= self.config.warn_after {
            Escalation::Warn
        } else {
            Escalation::None
        };

        match escalation {
            Escalation::None => {}
            Escalation::Warn => {
                info!(agent_id = %agent.id, count, "heartbeat warning");
                self.publish_agent_event(agent.id, "agent.heartbeat_warning", json!({
                    "consecutive_missed": count,
                }))
                .await;
            }
            Escalation::Degrade => {
                if agent.can_transition_to(AgentStatus::Degraded) {
                    agent.transition_to(AgentStatus::Degraded)?;
                    self.persist(&mut agent).await?;
                }
                self.publish_agent_event(agent.id, "agent.degraded", json!({
                    "consecutive_missed": count,
                }))
                .await;
            }
            Escalation::Guardian => {
                if agent.can_transition_to(AgentStatus::Degraded) {
                    agent.transition_to(AgentStatus::Degraded)?;
                    self.persist(&mut agent).await?;
                }
                self.publish_agent_event(agent.id, "agent.intervention_requested", json!({
                    "consecutive_missed": count,
                }))
                .await;
            }
            Escalation::Fail => {
                if agent.can_transition_to(AgentStatus::Failed) {
                    agent.transition_to(AgentStatus::Failed)?;
                    self.persist(&mut agent).await?;
                }
                self.publish_agent_event(agent.id, "agent.failed", json!({
                    "consecutive_missed": count,
                }))
                .await;
            }
        }

        Ok(escalation)
    }

    /// Update the rolling baseline and the agent's composite anomaly score.
    async fn update_anomaly(
        &self,
        agent: &mut Agent,
        metrics: &HealthMetrics,
    ) -> DomainResult<()> {
        let mut baseline = self
            .agent_repo
            .get_baseline(&agent.agent_type, None)
            .await?
            .unwrap_or_else(|| AgentBaseline::new(agent.agent_type.clone(), None));

        // Score against the baseline as it stood before this reading.
        let score = if baseline.sample_count > 0 {
            self.weights.score(&baseline, metrics)
        } else {
            0.0
        };
        baseline.observe(metrics);
        self.agent_repo.upsert_baseline(&baseline).await?;

        agent.anomaly_score = Some(score);
        if score >= self.config.anomaly_threshold {
            agent.consecutive_anomalous_readings += 1;
        } else {
            agent.consecutive_anomalous_readings = 0;
        }

        // Sustained anomaly feeds the same ladder as missed heartbeats.
        if agent.consecutive_anomalous_readings >= self.config.anomaly_consecutive {
            self.publish_agent_event(agent.id, "agent.anomaly_detected", json!({
                "anomaly_score": score,
                "consecutive_readings": agent.consecutive_anomalous_readings,
            }))
            .await;
            self.escalate(agent.id, agent.consecutive_anomalous_readings)
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, agent: &mut Agent) -> DomainResult<()> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            match self
                .agent_repo
                .update_with_version_check(agent, agent.version - 1)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ DomainError::StaleWrite { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    let Some(current) = self.agent_repo.get(agent.id).await? else {
                        return Err(DomainError::AgentNotFound(agent.id));
                    };
                    let mut rebased = current;
                    rebased.status = agent.status;
                    rebased.health = agent.health.clone();
                    rebased.anomaly_score = agent.anomaly_score;
                    rebased.consecutive_anomalous_readings = agent.consecutive_anomalous_readings;
                    rebased.sequence_number = agent.sequence_number;
                    rebased.last_expected_sequence = agent.last_expected_sequence;
                    rebased.consecutive_missed_heartbeats = agent.consecutive_missed_heartbeats;
                    rebased.corrupt_heartbeats = agent.corrupt_heartbeats;
                    rebased.last_heartbeat_at = agent.last_heartbeat_at;
                    rebased.current_task_id = agent.current_task_id;
                    rebased.failed_at = agent.failed_at;
                    rebased.version += 1;
                    *agent = rebased;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn publish_agent_event(
        &self,
        agent_id: uuid::Uuid,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        let envelope = EventEnvelope::new(
            event_type,
            EntityType::Agent,
            agent_id.to_string(),
            payload,
        );
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(agent_id = %agent_id, error = %err, "failed to publish agent event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomaly_score_bounded() {
        let weights = AnomalyWeights::default();
        let mut baseline = AgentBaseline::new("coder", None);
        baseline.latency_ms_mean = 100.0;
        baseline.latency_ms_std = 10.0;
        baseline.error_rate = 0.01;
        baseline.cpu_usage_percent = 20.0;
        baseline.memory_usage_mb = 512.0;
        baseline.sample_count = 50;

        // Everything wildly over baseline still caps at 1.0.
        let metrics = HealthMetrics {
            avg_latency_ms: 10_000.0,
            error_rate: 1.0,
            cpu_usage_percent: 100.0,
            memory_usage_mb: 100_000.0,
            queue_depth: 1000,
            active_connections: 0,
        };
        let score = weights.score(&baseline, &metrics);
        assert!(score <= 1.0);
        assert!(score > 0.9);
    }

    #[test]
    fn test_no_single_signal_dominates() {
        let weights = AnomalyWeights::default();
        let mut baseline = AgentBaseline::new("coder", None);
        baseline.latency_ms_mean = 100.0;
        baseline.latency_ms_std = 10.0;
        baseline.sample_count = 50;

        // Only latency is anomalous; the composite stays below the
        // default 0.7 quarantine threshold.
        let metrics = HealthMetrics {
            avg_latency_ms: 10_000.0,
            ..Default::default()
        };
        let score = weights.score(&baseline, &metrics);
        assert!(score <= weights.latency + 1e-9);
        assert!(score < 0.7);
    }

    #[test]
    fn test_healthy_reading_scores_low() {
        let weights = AnomalyWeights::default();
        let mut baseline = AgentBaseline::new("coder", None);
        baseline.latency_ms_mean = 100.0;
        baseline.latency_ms_std = 10.0;
        baseline.error_rate = 0.01;
        baseline.cpu_usage_percent = 20.0;
        baseline.memory_usage_mb = 512.0;
        baseline.sample_count = 50;

        let metrics = HealthMetrics {
            avg_latency_ms: 102.0,
            error_rate: 0.01,
            cpu_usage_percent: 21.0,
            memory_usage_mb: 520.0,
            queue_depth: 1,
            active_connections: 1,
        };
        assert!(weights.score(&baseline, &metrics) < 0.2);
    }

    #[test]
    fn test_skew_clamps() {
        assert!((skew(0.0, 0.0)).abs() < f64::EPSILON);
        assert!((skew(100.0, 50.0) - 1.0).abs() < f64::EPSILON);
        assert!((skew(60.0, 50.0) - 0.2).abs() < 1e-9);
        assert!((skew(10.0, 50.0)).abs() < f64::EPSILON);
    }
}
