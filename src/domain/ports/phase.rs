//! Executor and evaluator ports for the spec phase workflow.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EvalResult, SpecPhase};
use crate::domain::ports::agent_driver::TurnUsage;

/// Inputs to one phase execution attempt.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub spec_id: uuid::Uuid,
    pub spec_title: String,
    pub spec_description: String,
    /// Frozen outputs of earlier phases
    pub accumulated: serde_json::Value,
    /// Evaluator feedback from a prior failed attempt
    pub feedback: Option<String>,
    /// Directory the executor must write its structured output into
    pub output_dir: PathBuf,
}

/// Result of driving the agent for one phase attempt.
#[derive(Debug, Clone)]
pub struct PhaseExecution {
    /// File the executor wrote its structured output to
    /// (`<output>/<phase>.json`); the state machine reads this, never chat
    /// text.
    pub output_path: PathBuf,
    pub transcript_b64: Option<String>,
    pub usage: TurnUsage,
}

/// Drives the coding agent for one phase with a capped budget and a
/// designated tool set.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute_phase(
        &self,
        phase: SpecPhase,
        context: &PhaseContext,
    ) -> DomainResult<PhaseExecution>;
}

/// Scores a phase's structured output.
#[async_trait]
pub trait PhaseEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        phase: SpecPhase,
        output: &serde_json::Value,
        accumulated: &serde_json::Value,
    ) -> DomainResult<EvalResult>;
}
