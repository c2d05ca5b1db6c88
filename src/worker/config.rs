//! Sandbox worker configuration.
//!
//! The worker runs inside an isolated sandbox and is configured entirely
//! through environment variables injected by the orchestrator. Unknown
//! variables are ignored so the same binary works in every environment.

use std::path::PathBuf;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::PermissionMode;

/// Everything the sandbox worker recognizes from its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    // Core identity
    pub sandbox_id: String,
    pub callback_url: String,
    pub task_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,

    // Model / API
    pub model: Option<String>,
    pub api_key: Option<String>,

    // Task context
    /// Base64 JSON with the full task context from the orchestrator
    pub task_data_base64: Option<String>,

    // Timing
    /// Message poll interval in seconds
    pub poll_interval: f64,
    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,

    // Caps
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub max_duration_s: u64,

    // Agent behavior
    pub permission_mode: PermissionMode,
    /// Comma-separated tool list
    pub allowed_tools: Option<String>,
    pub cwd: Option<PathBuf>,

    // Continuous mode
    pub continuous_mode: bool,
    pub continuous_max_runs: u32,
    pub completion_signal: String,
    pub completion_threshold: u32,
    /// Notes file folded into the re-prompt between iterations
    pub notes_file: String,

    // Spec workflow
    pub require_spec_skill: bool,
    pub spec_id: Option<Uuid>,
    pub spec_title: Option<String>,
    pub spec_description: Option<String>,
    /// Run only this phase instead of the full workflow
    pub spec_phase: Option<String>,
    pub output_directory: PathBuf,
    /// Base64 JSON of accumulated phase context
    pub phase_context_b64: Option<String>,

    // Git
    pub github_repo: Option<String>,
    pub github_token: Option<String>,
    /// Branch to check out during boot
    pub branch_name: Option<String>,

    // Preview
    pub preview_enabled: bool,

    // Session resumption
    pub resume_session_id: Option<String>,
    pub session_transcript_b64: Option<String>,

    // Reporter
    /// array (test), jsonl (local), http (production)
    pub reporter_mode: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sandbox_id: "local-sandbox".to_string(),
            callback_url: "http://localhost:8000".to_string(),
            task_id: None,
            agent_id: None,
            model: None,
            api_key: None,
            task_data_base64: None,
            poll_interval: 0.5,
            heartbeat_interval: 30,
            max_turns: 50,
            max_budget_usd: 10.0,
            max_duration_s: 3600,
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: None,
            cwd: None,
            continuous_mode: false,
            continuous_max_runs: 10,
            completion_signal: "TASK_COMPLETE".to_string(),
            completion_threshold: 2,
            notes_file: "ITERATION_NOTES.md".to_string(),
            require_spec_skill: false,
            spec_id: None,
            spec_title: None,
            spec_description: None,
            spec_phase: None,
            output_directory: PathBuf::from(".spec-output"),
            phase_context_b64: None,
            github_repo: None,
            github_token: None,
            branch_name: None,
            preview_enabled: false,
            resume_session_id: None,
            session_transcript_b64: None,
            reporter_mode: "http".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load from the environment: defaults merged with raw env vars
    /// (`SANDBOX_ID`, `CALLBACK_URL`, `MAX_TURNS`, ...). Unrecognized
    /// variables are ignored.
    pub fn from_env() -> DomainResult<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::raw())
            .extract()
            .map_err(|e| DomainError::ValidationFailed(format!("worker config: {e}")))
    }

    /// Allowed tool names, split from the comma list.
    pub fn allowed_tools(&self) -> Vec<String> {
        self.allowed_tools
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decode the base64 JSON task context.
    pub fn decode_task_context(&self) -> DomainResult<Option<serde_json::Value>> {
        use base64::Engine;
        let Some(encoded) = &self.task_data_base64 else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DomainError::ValidationFailed(format!("task_data_base64: {e}")))?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }

    /// Decode the accumulated phase context, empty object when absent.
    pub fn decode_phase_context(&self) -> DomainResult<serde_json::Value> {
        use base64::Engine;
        let Some(encoded) = &self.phase_context_b64 else {
            return Ok(serde_json::json!({}));
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DomainError::ValidationFailed(format!("phase_context_b64: {e}")))?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(value)
    }

    /// Working directory, defaulting to the current directory.
    pub fn working_directory(&self) -> PathBuf {
        self.cwd.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
