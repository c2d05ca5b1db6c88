//! Agent domain model and lifecycle state machine.
//!
//! Agents are the supervised executors running inside sandboxes. Their
//! status advances only along the published state graph; `TERMINATED` has
//! no outgoing edges. Heartbeat bookkeeping (sequence, gaps, anomaly
//! counters) lives on the agent row and is collapsed from individual
//! heartbeat messages by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Sandbox is being provisioned
    Spawning,
    /// Ready to receive a task
    Idle,
    /// Executing a task
    Running,
    /// Anomalous but still operating
    Degraded,
    /// Stopped responding or crashed
    Failed,
    /// Isolated, recoverable after review
    Quarantined,
    /// Permanently gone (terminal)
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "SPAWNING",
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Degraded => "DEGRADED",
            Self::Failed => "FAILED",
            Self::Quarantined => "QUARANTINED",
            Self::Terminated => "TERMINATED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SPAWNING" => Some(Self::Spawning),
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "DEGRADED" => Some(Self::Degraded),
            "FAILED" => Some(Self::Failed),
            "QUARANTINED" => Some(Self::Quarantined),
            "TERMINATED" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Terminal: no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether the agent can accept new task assignments.
    pub fn can_accept_tasks(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The published transition graph.
    pub fn valid_transitions(&self) -> &'static [AgentStatus] {
        match self {
            Self::Spawning => &[Self::Idle, Self::Failed, Self::Terminated],
            Self::Idle => &[
                Self::Running,
                Self::Degraded,
                Self::Quarantined,
                Self::Terminated,
            ],
            Self::Running => &[Self::Idle, Self::Failed, Self::Degraded, Self::Quarantined],
            Self::Degraded => &[
                Self::Idle,
                Self::Failed,
                Self::Quarantined,
                Self::Terminated,
            ],
            Self::Failed => &[Self::Quarantined, Self::Terminated],
            Self::Quarantined => &[Self::Idle, Self::Terminated],
            Self::Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Vitals reported with each heartbeat and folded into the agent row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    #[serde(default)]
    pub cpu_usage_percent: f64,
    #[serde(default)]
    pub memory_usage_mb: f64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub active_connections: u32,
}

/// A supervised agent instance bound to a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// Agent type label used for capability routing and baselines
    pub agent_type: String,
    pub status: AgentStatus,
    /// Capabilities this agent satisfies during task matching
    pub capabilities: Vec<String>,
    /// Concurrent task capacity (currently 1 for sandboxed agents)
    pub capacity: u32,
    pub current_task_id: Option<Uuid>,
    pub sandbox_id: Option<String>,
    /// Latest folded vitals
    pub health: HealthMetrics,
    /// Composite anomaly score in [0,1], None before first reading
    pub anomaly_score: Option<f64>,
    pub consecutive_anomalous_readings: u32,
    /// Last accepted heartbeat sequence number
    pub sequence_number: u64,
    /// Next sequence the monitor expects
    pub last_expected_sequence: u64,
    pub consecutive_missed_heartbeats: u32,
    /// Heartbeats dropped for checksum failure
    pub corrupt_heartbeats: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// When the agent entered FAILED (starts the recovery grace window)
    pub failed_at: Option<DateTime<Utc>>,
    pub crypto_public_key: Option<String>,
    pub metadata: serde_json::Value,
    /// Exempt from cleanup termination while a validation run needs it.
    /// Still counts against capacity; re-enters IDLE only via QUARANTINED.
    pub kept_alive_for_validation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Agent {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Spawning,
            capabilities: Vec::new(),
            capacity: 1,
            current_task_id: None,
            sandbox_id: None,
            health: HealthMetrics::default(),
            anomaly_score: None,
            consecutive_anomalous_readings: 0,
            sequence_number: 0,
            last_expected_sequence: 1,
            consecutive_missed_heartbeats: 0,
            corrupt_heartbeats: 0,
            last_heartbeat_at: None,
            failed_at: None,
            crypto_public_key: None,
            metadata: serde_json::Value::Null,
            kept_alive_for_validation: false,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }

    pub fn can_transition_to(&self, new_status: AgentStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition along the published graph; illegal transitions fail
    /// without mutating state.
    pub fn transition_to(&mut self, new_status: AgentStatus) -> DomainResult<()> {
        if !self.can_transition_to(new_status) {
            return Err(DomainError::InvalidTransition {
                entity: "agent",
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        self.version += 1;

        match new_status {
            AgentStatus::Failed => self.failed_at = Some(Utc::now()),
            AgentStatus::Idle => {
                self.failed_at = None;
                self.current_task_id = None;
            }
            _ => {}
        }

        Ok(())
    }

    /// Assign a task. Only IDLE agents accept assignments; assignment
    /// implies IDLE → RUNNING.
    pub fn assign_task(&mut self, task_id: Uuid) -> DomainResult<()> {
        if !self.status.can_accept_tasks() {
            return Err(DomainError::InvalidTransition {
                entity: "agent",
                from: self.status.as_str().to_string(),
                to: AgentStatus::Running.as_str().to_string(),
            });
        }
        self.current_task_id = Some(task_id);
        self.transition_to(AgentStatus::Running)
    }

    /// Whether this agent satisfies the given capability requirements.
    /// An empty requirement set matches any agent.
    pub fn satisfies(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|have| have == cap))
    }
}

/// Rolling per-(agent_type, phase) statistics for anomaly detection.
///
/// Updated with exponentially weighted moving averages so recent samples
/// dominate without storing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBaseline {
    pub id: Uuid,
    pub agent_type: String,
    pub phase: Option<String>,
    pub latency_ms_mean: f64,
    pub latency_ms_std: f64,
    pub error_rate: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl AgentBaseline {
    /// Smoothing factor for the EWMA updates.
    pub const ALPHA: f64 = 0.2;

    pub fn new(agent_type: impl Into<String>, phase: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.into(),
            phase,
            latency_ms_mean: 0.0,
            latency_ms_std: 1.0,
            error_rate: 0.0,
            cpu_usage_percent: 0.0,
            memory_usage_mb: 0.0,
            sample_count: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one reading into the rolling statistics.
    pub fn observe(&mut self, metrics: &HealthMetrics) {
        let a = Self::ALPHA;
        if self.sample_count == 0 {
            self.latency_ms_mean = metrics.avg_latency_ms;
            self.error_rate = metrics.error_rate;
            self.cpu_usage_percent = metrics.cpu_usage_percent;
            self.memory_usage_mb = metrics.memory_usage_mb;
        } else {
            let dev = (metrics.avg_latency_ms - self.latency_ms_mean).abs();
            self.latency_ms_std = (1.0 - a) * self.latency_ms_std + a * dev;
            self.latency_ms_mean = (1.0 - a) * self.latency_ms_mean + a * metrics.avg_latency_ms;
            self.error_rate = (1.0 - a) * self.error_rate + a * metrics.error_rate;
            self.cpu_usage_percent =
                (1.0 - a) * self.cpu_usage_percent + a * metrics.cpu_usage_percent;
            self.memory_usage_mb = (1.0 - a) * self.memory_usage_mb + a * metrics.memory_usage_mb;
        }
        self.sample_count += 1;
        self.last_updated = Utc::now();
    }

    /// Z-score of a latency sample against this baseline.
    pub fn latency_z(&self, latency_ms: f64) -> f64 {
        if self.latency_ms_std <= f64::EPSILON {
            return 0.0;
        }
        (latency_ms - self.latency_ms_mean) / self.latency_ms_std
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_to_idle_to_running() {
        let mut agent = Agent::new("worker-1", "coder");
        agent.transition_to(AgentStatus::Idle).unwrap();
        let task_id = Uuid::new_v4();
        agent.assign_task(task_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.current_task_id, Some(task_id));
    }

    #[test]
    fn test_assignment_requires_idle() {
        let mut agent = Agent::new("worker-1", "coder");
        // Spawning agents do not accept tasks
        assert!(agent.assign_task(Uuid::new_v4()).is_err());

        agent.transition_to(AgentStatus::Idle).unwrap();
        agent.assign_task(Uuid::new_v4()).unwrap();
        // Running agents do not accept a second task
        assert!(agent.assign_task(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_terminated_has_no_outgoing_edges() {
        let mut agent = Agent::new("worker-1", "coder");
        agent.transition_to(AgentStatus::Terminated).unwrap();
        for target in [
            AgentStatus::Spawning,
            AgentStatus::Idle,
            AgentStatus::Running,
            AgentStatus::Degraded,
            AgentStatus::Failed,
            AgentStatus::Quarantined,
        ] {
            let err = agent.transition_to(target).unwrap_err();
            assert!(matches!(err, DomainError::InvalidTransition { .. }));
            assert_eq!(agent.status, AgentStatus::Terminated);
        }
    }

    #[test]
    fn test_illegal_transition_does_not_mutate() {
        let mut agent = Agent::new("worker-1", "coder");
        let version = agent.version;
        assert!(agent.transition_to(AgentStatus::Running).is_err());
        assert_eq!(agent.status, AgentStatus::Spawning);
        assert_eq!(agent.version, version);
    }

    #[test]
    fn test_failure_recovery_path() {
        let mut agent = Agent::new("worker-1", "coder");
        agent.transition_to(AgentStatus::Idle).unwrap();
        agent.assign_task(Uuid::new_v4()).unwrap();
        agent.transition_to(AgentStatus::Failed).unwrap();
        assert!(agent.failed_at.is_some());
        agent.transition_to(AgentStatus::Quarantined).unwrap();
        agent.transition_to(AgentStatus::Idle).unwrap();
        assert!(agent.failed_at.is_none());
        assert!(agent.current_task_id.is_none());
    }

    #[test]
    fn test_capability_matching() {
        let agent = Agent::new("worker-1", "coder")
            .with_capabilities(vec!["rust".to_string(), "git".to_string()]);

        assert!(agent.satisfies(&[]));
        assert!(agent.satisfies(&["rust".to_string()]));
        assert!(agent.satisfies(&["rust".to_string(), "git".to_string()]));
        assert!(!agent.satisfies(&["python".to_string()]));
    }

    #[test]
    fn test_baseline_ewma() {
        let mut baseline = AgentBaseline::new("coder", None);
        let m1 = HealthMetrics {
            avg_latency_ms: 100.0,
            error_rate: 0.0,
            cpu_usage_percent: 20.0,
            memory_usage_mb: 512.0,
            ..Default::default()
        };
        baseline.observe(&m1);
        assert!((baseline.latency_ms_mean - 100.0).abs() < f64::EPSILON);
        assert_eq!(baseline.sample_count, 1);

        let m2 = HealthMetrics {
            avg_latency_ms: 200.0,
            ..m1.clone()
        };
        baseline.observe(&m2);
        assert!(baseline.latency_ms_mean > 100.0);
        assert!(baseline.latency_ms_mean < 200.0);
    }

    #[test]
    fn test_latency_z_guards_zero_std() {
        let mut baseline = AgentBaseline::new("coder", None);
        baseline.latency_ms_std = 0.0;
        assert!((baseline.latency_z(500.0)).abs() < f64::EPSILON);
    }
}
