//! Phase executors.
//!
//! `AgentPhaseExecutor` drives the coding agent for one phase with the
//! phase's prompt, tool set, and a capped turn budget, streaming every
//! block to the reporter. The agent writes its structured output to
//! `<output>/<phase>.json`; the state machine reads the file. The
//! `ScriptedExecutor` writes canned outputs directly, for tests and mock
//! runs without an agent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::phases;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::event_types;
use crate::domain::models::{EventSource, SandboxEvent, SpecPhase};
use crate::domain::ports::{
    AgentBlock, AgentDriver, EventReporter, PhaseContext, PhaseExecution, PhaseExecutor,
    SessionOptions, TurnUsage,
};

/// Drives the real coding agent for each phase.
pub struct AgentPhaseExecutor {
    driver: Arc<dyn AgentDriver>,
    reporter: Arc<dyn EventReporter>,
    sandbox_id: String,
    model: Option<String>,
    /// Turn cap per phase attempt
    max_turns: u32,
}

impl AgentPhaseExecutor {
    pub fn new(
        driver: Arc<dyn AgentDriver>,
        reporter: Arc<dyn EventReporter>,
        sandbox_id: impl Into<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            driver,
            reporter,
            sandbox_id: sandbox_id.into(),
            model,
            max_turns: 20,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }
}

#[async_trait]
impl PhaseExecutor for AgentPhaseExecutor {
    async fn execute_phase(
        &self,
        phase: SpecPhase,
        context: &PhaseContext,
    ) -> DomainResult<PhaseExecution> {
        tokio::fs::create_dir_all(&context.output_dir).await?;

        let options = SessionOptions {
            model: self.model.clone(),
            system_prompt: Some(format!(
                "You are executing the {} phase of a spec-driven workflow. \
                 Write structured output to the file named in the instructions; \
                 your chat text is not read.",
                phase.as_str()
            )),
            allowed_tools: phases::allowed_tools(phase)
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_turns: self.max_turns,
            cwd: None,
            resume_session_id: None,
            session_transcript_b64: None,
        };

        let mut session = self.driver.open_session(options).await?;
        let prompt = phases::prompt_for(phase, context);
        session.send_user(&prompt).await?;

        let mut usage = TurnUsage::default();
        while let Some(block) = session.next_block().await? {
            let (event_type, data) = match &block {
                AgentBlock::Text { text } => (event_types::AGENT_TEXT, json!({"text": text})),
                AgentBlock::Thinking { text } => {
                    (event_types::AGENT_THINKING, json!({"text": text}))
                }
                AgentBlock::ToolUse {
                    tool_use_id,
                    name,
                    input,
                } => (
                    event_types::AGENT_TOOL_USE,
                    json!({"tool_use_id": tool_use_id, "name": name, "input": input}),
                ),
                AgentBlock::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                    ..
                } => (
                    event_types::AGENT_TOOL_RESULT,
                    json!({"tool_use_id": tool_use_id, "output": output, "is_error": is_error}),
                ),
            };
            self.reporter
                .report(
                    SandboxEvent::new(&self.sandbox_id, event_type, data, EventSource::Agent)
                        .with_spec(context.spec_id),
                )
                .await?;
        }
        usage.add(session.last_turn_usage());

        let output_path = context.output_dir.join(format!("{}.json", phase.as_str()));
        if !output_path.exists() {
            return Err(DomainError::ValidationFailed(format!(
                "phase {} produced no output file at {}",
                phase.as_str(),
                output_path.display()
            )));
        }
        debug!(phase = phase.as_str(), path = %output_path.display(), "phase output written");

        Ok(PhaseExecution {
            output_path,
            transcript_b64: session.transcript_b64().ok(),
            usage,
        })
    }
}

/// Writes canned phase outputs straight to disk; per-phase overrides with
/// a structurally valid default for the rest.
pub struct ScriptedExecutor {
    outputs: Mutex<HashMap<SpecPhase, Vec<serde_json::Value>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an output for a phase; successive attempts consume in order,
    /// the last one repeating.
    pub async fn push_output(&self, phase: SpecPhase, output: serde_json::Value) {
        self.outputs.lock().await.entry(phase).or_default().push(output);
    }

    /// A structurally valid default output per phase.
    pub fn default_output(phase: SpecPhase) -> serde_json::Value {
        match phase {
            SpecPhase::Explore => json!({
                "architecture": "Hexagonal core with repositories behind ports and services over an event bus.",
                "key_files": ["src/lib.rs", "src/services/mod.rs"],
                "patterns": ["repository pattern", "typed event envelopes"],
                "constraints": ["optimistic locking on all mutable rows"],
            }),
            SpecPhase::Requirements => json!({
                "requirements": [
                    {"id": "REQ-SCH-PRI-001", "title": "Dynamic scoring", "statement": "The scheduler SHALL recompute task scores at admission.", "priority": "high"},
                    {"id": "REQ-SCH-DEP-002", "title": "Dependency gating", "statement": "A task MUST NOT start before every dependency succeeded.", "priority": "high"},
                ],
            }),
            SpecPhase::Design => json!({
                "overview": "A priority heap drains into sandboxed workers through the orchestrator loop.",
                "components": [
                    {"id": "DES-001", "name": "scheduler", "responsibility": "ordering and gating", "requirements": ["REQ-SCH-PRI-001"]},
                ],
                "diagram": "graph TD\n  scheduler --> orchestrator\n  orchestrator --> worker",
            }),
            SpecPhase::Tasks => json!({
                "tasks": [
                    {"id": "TSK-001", "title": "Implement scoring", "description": "Build the score formula.", "requirements": ["REQ-SCH-PRI-001"], "design_refs": ["DES-001"], "depends_on": [], "owned_files": ["src/services/scheduler.rs"]},
                ],
            }),
            SpecPhase::Sync => json!({
                "artifacts": ["requirements/req-sch-pri-001.md", "tasks/tsk-001.md"],
                "tickets": [
                    {"id": "TKT-001", "title": "Scheduler work", "dependencies": {"blocked_by": [], "blocks": []}},
                ],
            }),
            SpecPhase::Complete => json!({}),
        }
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute_phase(
        &self,
        phase: SpecPhase,
        context: &PhaseContext,
    ) -> DomainResult<PhaseExecution> {
        let output = {
            let mut outputs = self.outputs.lock().await;
            match outputs.get_mut(&phase) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if queue.len() == 1 => queue[0].clone(),
                _ => Self::default_output(phase),
            }
        };

        tokio::fs::create_dir_all(&context.output_dir).await?;
        let output_path = context.output_dir.join(format!("{}.json", phase.as_str()));
        tokio::fs::write(&output_path, serde_json::to_vec_pretty(&output)?).await?;

        Ok(PhaseExecution {
            output_path,
            transcript_b64: None,
            usage: TurnUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                cost_usd: 0.001,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context(dir: PathBuf) -> PhaseContext {
        PhaseContext {
            spec_id: uuid::Uuid::new_v4(),
            spec_title: "t".to_string(),
            spec_description: "d".to_string(),
            accumulated: json!({}),
            feedback: None,
            output_dir: dir,
        }
    }

    #[tokio::test]
    async fn test_scripted_executor_writes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new();
        let execution = executor
            .execute_phase(SpecPhase::Explore, &context(dir.path().to_path_buf()))
            .await
            .unwrap();

        assert!(execution.output_path.ends_with("explore.json"));
        let contents = std::fs::read_to_string(&execution.output_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(value.get("architecture").is_some());
    }

    #[tokio::test]
    async fn test_scripted_executor_consumes_queue() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new();
        executor
            .push_output(SpecPhase::Explore, json!({"attempt": 1}))
            .await;
        executor
            .push_output(SpecPhase::Explore, json!({"attempt": 2}))
            .await;

        let ctx = context(dir.path().to_path_buf());
        executor.execute_phase(SpecPhase::Explore, &ctx).await.unwrap();
        let first: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ctx.output_dir.join("explore.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(first["attempt"], 1);

        executor.execute_phase(SpecPhase::Explore, &ctx).await.unwrap();
        let second: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ctx.output_dir.join("explore.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(second["attempt"], 2);
    }

    #[tokio::test]
    async fn test_default_outputs_pass_structural_evaluation() {
        use crate::domain::ports::PhaseEvaluator;
        use crate::worker::spec::evaluator::StructuralEvaluator;

        let evaluator = StructuralEvaluator::new();
        for phase in SpecPhase::WORKFLOW {
            let output = ScriptedExecutor::default_output(phase);
            let result = evaluator.evaluate(phase, &output, &json!({})).await.unwrap();
            assert!(
                result.passed,
                "default output for {phase:?} scored {}",
                result.score
            );
        }
    }
}
