//! Spec domain model and phase workflow types.
//!
//! A spec advances through five ordered phases toward executable tickets
//! and tasks. Phases only move forward; each completed phase freezes its
//! artifact into `phase_data` and checkpoints enough state for a fresh
//! sandbox to resume at the next phase.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Ordered spec workflow phases, with a terminal `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecPhase {
    Explore,
    Requirements,
    Design,
    Tasks,
    Sync,
    Complete,
}

impl SpecPhase {
    /// The five executable phases, in order.
    pub const WORKFLOW: [SpecPhase; 5] = [
        Self::Explore,
        Self::Requirements,
        Self::Design,
        Self::Tasks,
        Self::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Requirements => "requirements",
            Self::Design => "design",
            Self::Tasks => "tasks",
            Self::Sync => "sync",
            Self::Complete => "complete",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "explore" => Some(Self::Explore),
            "requirements" => Some(Self::Requirements),
            "design" => Some(Self::Design),
            "tasks" => Some(Self::Tasks),
            "sync" => Some(Self::Sync),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    /// The phase after this one, None once complete.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Explore => Some(Self::Requirements),
            Self::Requirements => Some(Self::Design),
            Self::Design => Some(Self::Tasks),
            Self::Tasks => Some(Self::Sync),
            Self::Sync => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Result of evaluating a phase's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Evaluation score in [0, 1]
    pub score: f64,
    /// Whether the score met the threshold
    pub passed: bool,
    /// Feedback appended to the prompt on retry
    pub feedback: Option<String>,
    /// Per-criterion detail scores
    pub details: serde_json::Value,
}

impl EvalResult {
    /// Default passing threshold for phase evaluations.
    pub const DEFAULT_THRESHOLD: f64 = 0.7;

    pub fn scored(score: f64, threshold: f64, feedback: Option<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            passed: score >= threshold,
            feedback,
            details: serde_json::Value::Null,
        }
    }
}

/// Result of executing one phase once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: SpecPhase,
    pub success: bool,
    pub eval_score: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// A structured design artifact advancing through the phase workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub current_phase: SpecPhase,
    /// Frozen output per completed phase
    pub phase_data: BTreeMap<String, serde_json::Value>,
    /// Base64 session transcript per phase, for cross-sandbox resumption
    pub session_transcripts: BTreeMap<String, String>,
    /// Attempts consumed per phase (including the passing one)
    pub phase_attempts: BTreeMap<String, u32>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Opaque token for read-only sharing
    pub share_token: Option<String>,
    pub archived: bool,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Spec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            current_phase: SpecPhase::Explore,
            phase_data: BTreeMap::new(),
            session_transcripts: BTreeMap::new(),
            phase_attempts: BTreeMap::new(),
            last_checkpoint_at: None,
            last_error: None,
            share_token: None,
            archived: false,
            user_id: None,
            project_id: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Freeze a completed phase's output and advance to the next phase.
    ///
    /// Phases only advance forward; attempting to complete any phase other
    /// than the current one is rejected.
    pub fn complete_phase(
        &mut self,
        phase: SpecPhase,
        output: serde_json::Value,
        transcript_b64: Option<String>,
    ) -> DomainResult<()> {
        if phase != self.current_phase {
            return Err(DomainError::InvalidTransition {
                entity: "spec_phase",
                from: self.current_phase.as_str().to_string(),
                to: phase.as_str().to_string(),
            });
        }
        let next = phase.next().ok_or_else(|| DomainError::InvalidTransition {
            entity: "spec_phase",
            from: phase.as_str().to_string(),
            to: "beyond complete".to_string(),
        })?;

        self.phase_data.insert(phase.as_str().to_string(), output);
        if let Some(transcript) = transcript_b64 {
            self.session_transcripts
                .insert(phase.as_str().to_string(), transcript);
        }
        self.current_phase = next;
        self.last_checkpoint_at = Some(Utc::now());
        self.last_error = None;
        self.touch();
        Ok(())
    }

    /// Record a failed attempt for the current phase.
    pub fn record_attempt(&mut self, phase: SpecPhase, error: Option<String>) {
        let entry = self
            .phase_attempts
            .entry(phase.as_str().to_string())
            .or_insert(0);
        *entry += 1;
        if let Some(err) = error {
            self.last_error = Some(err);
        }
        self.touch();
    }

    pub fn attempts_for(&self, phase: SpecPhase) -> u32 {
        self.phase_attempts
            .get(phase.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.current_phase.is_terminal()
    }

    /// Accumulated context passed to executors: all frozen phase outputs.
    pub fn accumulated_context(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.phase_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}
