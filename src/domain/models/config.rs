//! Orchestrator configuration model.
//!
//! Loaded by `infrastructure::config::ConfigLoader` with hierarchical
//! merging (defaults → `.foreman/config.yaml` → `.foreman/local.yaml` →
//! `FOREMAN_*` environment).

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sandbox: SandboxProviderConfig,
}

/// Orchestrator loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running sandboxed agents
    pub max_agents: usize,
    /// Idle sleep between scheduler polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Sandbox acquisition attempts before a task fails
    pub sandbox_acquire_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            poll_interval_ms: 500,
            sandbox_acquire_attempts: 3,
        }
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".foreman/foreman.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// json or pretty
    pub format: String,
    /// Optional directory for rotated log files
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            log_dir: None,
        }
    }
}

/// Weights for the dynamic scheduling score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub priority_weight: f64,
    pub age_weight: f64,
    pub deadline_weight: f64,
    pub downstream_weight: f64,
    pub retry_penalty: f64,
    /// Horizon for deadline urgency, in hours
    pub deadline_horizon_hours: f64,
    /// Base retry backoff in seconds
    pub retry_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_weight: 1.0,
            age_weight: 0.1,
            deadline_weight: 2.0,
            downstream_weight: 0.5,
            retry_penalty: 0.5,
            deadline_horizon_hours: 24.0,
            retry_backoff_secs: 30,
        }
    }
}

/// Heartbeat protocol and escalation ladder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Expected heartbeat interval in seconds
    pub interval_secs: u64,
    /// Missed-heartbeat ladder thresholds
    pub warn_after: u32,
    pub degrade_after: u32,
    pub guardian_after: u32,
    pub fail_after: u32,
    /// Grace window after FAILED before quarantine/terminate, in seconds
    pub recovery_grace_secs: u64,
    /// Composite anomaly score threshold
    pub anomaly_threshold: f64,
    /// Consecutive anomalous readings before escalation
    pub anomaly_consecutive: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            warn_after: 1,
            degrade_after: 2,
            guardian_after: 4,
            fail_after: 6,
            recovery_grace_secs: 120,
            anomaly_threshold: 0.7,
            anomaly_consecutive: 3,
        }
    }
}

/// Guardian policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Actions at or below this authority level execute without approval
    pub auto_authority: u8,
    /// Approval window in seconds before an action times out
    pub approval_timeout_secs: u64,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            auto_authority: 2,
            approval_timeout_secs: 900,
        }
    }
}

/// Shared retry/backoff settings for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Sandbox provider endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Default image for new sandboxes
    pub image: String,
}

impl Default for SandboxProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            api_key: None,
            image: "foreman-agent:latest".to_string(),
        }
    }
}
