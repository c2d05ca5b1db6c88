//! Heartbeat protocol messages.
//!
//! Each agent emits a heartbeat with a strictly increasing sequence number
//! and a SHA-256 checksum over the canonical payload. The monitor verifies
//! the checksum, drops corrupt messages, and replies with an ack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::agent::{AgentStatus, HealthMetrics};

/// A heartbeat sent from an agent to the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub agent_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Monotonically increasing per agent
    pub sequence_number: u64,
    pub status: AgentStatus,
    pub current_task_id: Option<Uuid>,
    pub metrics: HealthMetrics,
    /// SHA-256 hex digest of the canonical payload
    pub checksum: String,
}

impl HeartbeatMessage {
    /// Build a heartbeat with a freshly computed checksum.
    pub fn new(
        agent_id: Uuid,
        sequence_number: u64,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        metrics: HealthMetrics,
    ) -> Self {
        let timestamp = Utc::now();
        let checksum = Self::compute_checksum(
            agent_id,
            timestamp,
            sequence_number,
            status,
            current_task_id,
            &metrics,
        );
        Self {
            agent_id,
            timestamp,
            sequence_number,
            status,
            current_task_id,
            metrics,
            checksum,
        }
    }

    /// Canonical payload string hashed into the checksum. Field order is
    /// fixed; changing it breaks wire compatibility.
    fn canonical_payload(
        agent_id: Uuid,
        timestamp: DateTime<Utc>,
        sequence_number: u64,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        metrics: &HealthMetrics,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}|{:.4}|{:.4}|{:.4}|{:.6}|{}",
            agent_id,
            timestamp.to_rfc3339(),
            sequence_number,
            status.as_str(),
            current_task_id.map_or_else(String::new, |id| id.to_string()),
            metrics.cpu_usage_percent,
            metrics.memory_usage_mb,
            metrics.avg_latency_ms,
            metrics.error_rate,
            metrics.queue_depth,
        )
    }

    pub fn compute_checksum(
        agent_id: Uuid,
        timestamp: DateTime<Utc>,
        sequence_number: u64,
        status: AgentStatus,
        current_task_id: Option<Uuid>,
        metrics: &HealthMetrics,
    ) -> String {
        let payload = Self::canonical_payload(
            agent_id,
            timestamp,
            sequence_number,
            status,
            current_task_id,
            metrics,
        );
        let digest = Sha256::digest(payload.as_bytes());
        format!("{digest:x}")
    }

    /// Whether the carried checksum matches the payload.
    pub fn verify_checksum(&self) -> bool {
        let expected = Self::compute_checksum(
            self.agent_id,
            self.timestamp,
            self.sequence_number,
            self.status,
            self.current_task_id,
            &self.metrics,
        );
        // Constant-length hex strings; plain comparison is fine here.
        expected == self.checksum
    }
}

/// Acknowledgment returned to the agent for each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub agent_id: Uuid,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    /// Whether the heartbeat was applied (replays ack with `received: true`
    /// but are not applied)
    pub received: bool,
    /// Optional advisory (gap warnings, escalation notices)
    pub message: Option<String>,
}

impl HeartbeatAck {
    pub fn received(agent_id: Uuid, sequence_number: u64) -> Self {
        Self {
            agent_id,
            sequence_number,
            timestamp: Utc::now(),
            received: true,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> HealthMetrics {
        HealthMetrics {
            cpu_usage_percent: 35.5,
            memory_usage_mb: 1024.0,
            avg_latency_ms: 120.0,
            error_rate: 0.01,
            queue_depth: 2,
            active_connections: 1,
        }
    }

    #[test]
    fn test_checksum_round_trip() {
        let hb = HeartbeatMessage::new(
            Uuid::new_v4(),
            1,
            AgentStatus::Running,
            Some(Uuid::new_v4()),
            sample_metrics(),
        );
        assert!(hb.verify_checksum());
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let mut hb = HeartbeatMessage::new(
            Uuid::new_v4(),
            1,
            AgentStatus::Running,
            None,
            sample_metrics(),
        );
        hb.sequence_number = 2;
        assert!(!hb.verify_checksum());

        let mut hb2 = HeartbeatMessage::new(
            Uuid::new_v4(),
            1,
            AgentStatus::Running,
            None,
            sample_metrics(),
        );
        hb2.metrics.cpu_usage_percent = 99.0;
        assert!(!hb2.verify_checksum());
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let hb = HeartbeatMessage::new(
            Uuid::new_v4(),
            7,
            AgentStatus::Idle,
            None,
            HealthMetrics::default(),
        );
        assert_eq!(hb.checksum.len(), 64);
        assert!(hb.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ack_builder() {
        let agent_id = Uuid::new_v4();
        let ack = HeartbeatAck::received(agent_id, 5).with_message("gap of 2 detected");
        assert!(ack.received);
        assert_eq!(ack.sequence_number, 5);
        assert_eq!(ack.message.as_deref(), Some("gap of 2 detected"));
    }
}
