//! The sandbox worker runtime.
//!
//! A single-threaded cooperative loop inside the sandbox: exactly one
//! agent turn proceeds at a time, with message polling and heartbeats as
//! interleaved tasks. The worker pumps agent blocks to the event
//! reporter, applies injected messages between turns (in order, deduped,
//! acked after delivery), enforces turn/budget/wall-time caps, and
//! terminates with a summary event. Failures surface as events, never as
//! HTTP errors to the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::WorkerConfig;
use super::continuous::{self, ContinuousState};
use super::diff;
use super::heartbeat::{run_heartbeat_loop, HeartbeatState};
use super::poller::MessagePoller;
use super::spec::{
    AgentPhaseExecutor, SpecMachineConfig, SpecStateMachine, StructuralEvaluator,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::event_types;
use crate::domain::models::{EventSource, SandboxEvent, Spec, SpecPhase};
use crate::domain::ports::{
    AgentBlock, AgentDriver, AgentSession, EventReporter, InjectedMessage, OrchestratorApi,
    PhaseEvaluator, PhaseExecutor, SessionOptions, SyncSummary, TurnUsage,
};
use crate::worker::spec::ArtifactSet;

/// Why the drive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StopReason {
    Completed,
    Canceled,
    CapExceeded(&'static str),
    Failed(String),
}

/// Final outcome of a worker run.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Terminal event type reported (`agent.completed`, `agent.failed`,
    /// `agent.budget_exhausted`)
    pub final_event: String,
    pub turns: u32,
    pub usage: TurnUsage,
    pub session_id: Option<String>,
    pub canceled: bool,
}

/// The long-running worker process (C6).
pub struct SandboxWorker {
    config: WorkerConfig,
    driver: Arc<dyn AgentDriver>,
    reporter: Arc<dyn EventReporter>,
    api: Arc<dyn OrchestratorApi>,
    spec_executor: Option<Arc<dyn PhaseExecutor>>,
    spec_evaluator: Option<Arc<dyn PhaseEvaluator>>,
}

impl SandboxWorker {
    pub fn new(
        config: WorkerConfig,
        driver: Arc<dyn AgentDriver>,
        reporter: Arc<dyn EventReporter>,
        api: Arc<dyn OrchestratorApi>,
    ) -> Self {
        Self {
            config,
            driver,
            reporter,
            api,
            spec_executor: None,
            spec_evaluator: None,
        }
    }

    /// Override the phase executor (mock runs, tests).
    pub fn with_spec_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.spec_executor = Some(executor);
        self
    }

    /// Override the phase evaluator.
    pub fn with_spec_evaluator(mut self, evaluator: Arc<dyn PhaseEvaluator>) -> Self {
        self.spec_evaluator = Some(evaluator);
        self
    }

    /// Run to termination. Always emits a terminal event; errors inside
    /// the drive loop become `agent.error` + `agent.failed` events.
    pub async fn run(&self) -> DomainResult<WorkerOutcome> {
        // Heartbeats run for the whole worker lifetime.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_state_tx, state_rx) = watch::channel(HeartbeatState::default());
        let heartbeat = self.config.agent_id.map(|agent_id| {
            tokio::spawn(run_heartbeat_loop(
                self.api.clone(),
                agent_id,
                self.config.heartbeat_interval,
                state_rx,
                shutdown_rx,
            ))
        });

        let outcome = if self.config.spec_id.is_some() {
            self.run_spec_workflow().await
        } else {
            self.run_task().await
        };

        let _ = shutdown_tx.send(true);
        if let Some(handle) = heartbeat {
            handle.abort();
        }

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Workers never raise over HTTP; surface as events.
                warn!(error = %err, "worker run failed");
                self.emit(
                    event_types::AGENT_ERROR,
                    json!({
                        "kind": if err.is_transient() { "transient" } else { "permanent" },
                        "message": err.to_string(),
                        "task_id": self.config.task_id,
                    }),
                )
                .await?;
                self.emit_terminal(
                    event_types::AGENT_FAILED,
                    0,
                    TurnUsage::default(),
                    None,
                    false,
                    Some(err.to_string()),
                )
                .await?;
                Ok(WorkerOutcome {
                    final_event: event_types::AGENT_FAILED.to_string(),
                    turns: 0,
                    usage: TurnUsage::default(),
                    session_id: None,
                    canceled: false,
                })
            }
        }
    }

    // -------------------------------------------------------------------
    // Task mode
    // -------------------------------------------------------------------

    async fn run_task(&self) -> DomainResult<WorkerOutcome> {
        let started = Instant::now();
        let mut turns: u32 = 0;
        let mut usage = TurnUsage::default();

        // Boundary: caps are enforced before the first turn, so
        // `max_turns = 0` exhausts without ever opening a conversation.
        if let Some(reason) = self.cap_exceeded(turns, &usage, started) {
            self.emit_terminal(
                event_types::AGENT_BUDGET_EXHAUSTED,
                turns,
                usage,
                None,
                false,
                Some(reason.to_string()),
            )
            .await?;
            return Ok(WorkerOutcome {
                final_event: event_types::AGENT_BUDGET_EXHAUSTED.to_string(),
                turns,
                usage,
                session_id: None,
                canceled: false,
            });
        }

        // Boot: resolve the workspace and check out the requested branch.
        if let Some(branch) = &self.config.branch_name {
            let switched =
                continuous::checkout_branch(&self.config.working_directory(), branch).await?;
            if !switched {
                warn!(branch = %branch, "branch checkout failed, continuing on current HEAD");
            }
        }

        let context = self.config.decode_task_context()?;
        let initial_prompt = context
            .as_ref()
            .and_then(|c| c.get("description"))
            .and_then(|v| v.as_str())
            .map_or_else(|| "Begin working on the task.".to_string(), str::to_string);

        let mut session = self
            .driver
            .open_session(SessionOptions {
                model: self.config.model.clone(),
                system_prompt: None,
                allowed_tools: self.config.allowed_tools(),
                max_turns: self.config.max_turns,
                cwd: Some(self.config.working_directory().display().to_string()),
                resume_session_id: self.config.resume_session_id.clone(),
                session_transcript_b64: self.config.session_transcript_b64.clone(),
            })
            .await?;

        if let Some(task_id) = self.config.task_id {
            self.api
                .register_conversation(task_id, &self.config.sandbox_id, session.session_id())
                .await?;
        }

        let mut poller = MessagePoller::new(self.api.clone(), self.config.sandbox_id.clone());
        let mut continuous_state = ContinuousState::new(
            self.config.completion_signal.clone(),
            self.config.completion_threshold,
            self.config.continuous_max_runs,
        );
        let mut pending: VecDeque<String> = VecDeque::from([initial_prompt]);
        let mut last_turn_text = String::new();
        let mut canceled = false;

        let stop = 'drive: loop {
            // Drain pending prompts, one turn each, caps checked before
            // every turn.
            while let Some(prompt) = pending.pop_front() {
                if let Some(reason) = self.cap_exceeded(turns, &usage, started) {
                    break 'drive StopReason::CapExceeded(reason);
                }
                last_turn_text = self.run_turn(session.as_mut(), &prompt).await?;
                turns += 1;
                usage.add(session.last_turn_usage());
            }

            // Between turns: apply queued injected messages in order.
            let messages = poller.fetch().await?;
            if !messages.is_empty() {
                let max_offset = messages.iter().map(|m| m.offset).max().unwrap_or(0);
                if messages.iter().any(InjectedMessage::is_cancellation) {
                    // Cooperative cancellation: the agent sees a
                    // continuation asking it to stop cleanly.
                    let cancel_prompt = "A cancellation was requested. Stop working, leave the \
                                         workspace in a consistent state, and summarize what was \
                                         done so far.";
                    last_turn_text = self.run_turn(session.as_mut(), cancel_prompt).await?;
                    turns += 1;
                    usage.add(session.last_turn_usage());
                    poller.acknowledge(max_offset);
                    canceled = true;
                    break 'drive StopReason::Canceled;
                }
                for message in &messages {
                    pending.push_back(message.content.clone());
                }
                // Cursor acked only after the messages were queued for the
                // agent; the next loop iteration delivers them.
                poller.acknowledge(max_offset);
                continue 'drive;
            }

            // No injected messages: decide whether we are done.
            if !self.config.continuous_mode {
                break 'drive StopReason::Completed;
            }

            continuous_state.record_run(&last_turn_text);
            if continuous_state.is_complete() {
                let tree = continuous::git_tree_state(&self.config.working_directory()).await?;
                if tree.is_clean() {
                    break 'drive StopReason::Completed;
                }
                // Dirty tree with no commit: not truly complete.
                continuous_state.invalidate_signal();
                let notes = continuous::read_notes(
                    &self.config.working_directory(),
                    &self.config.notes_file,
                )
                .await;
                pending.push_back(continuous::continuation_prompt(
                    continuous_state.runs + 1,
                    notes.as_deref(),
                    &tree,
                    &self.config.completion_signal,
                ));
                continue 'drive;
            }
            if continuous_state.runs_exhausted() {
                break 'drive StopReason::CapExceeded("continuous_max_runs");
            }

            let tree = continuous::git_tree_state(&self.config.working_directory()).await?;
            let notes = continuous::read_notes(
                &self.config.working_directory(),
                &self.config.notes_file,
            )
            .await;
            pending.push_back(continuous::continuation_prompt(
                continuous_state.runs + 1,
                notes.as_deref(),
                &tree,
                &self.config.completion_signal,
            ));
        };

        // Spec-output gate: success requires parseable frontmatter in
        // every artifact under the output directory.
        let stop = if matches!(stop, StopReason::Completed) && self.config.require_spec_skill {
            match self.validate_spec_output().await {
                Ok(()) => stop,
                Err(err) => StopReason::Failed(format!("spec_validation: {err}")),
            }
        } else {
            stop
        };

        let session_id = Some(session.session_id().to_string());
        let (final_event, reason) = match &stop {
            StopReason::Completed | StopReason::Canceled => (event_types::AGENT_COMPLETED, None),
            StopReason::CapExceeded(reason) => {
                (event_types::AGENT_BUDGET_EXHAUSTED, Some((*reason).to_string()))
            }
            StopReason::Failed(reason) => (event_types::AGENT_FAILED, Some(reason.clone())),
        };

        self.emit_terminal(final_event, turns, usage, session_id.as_deref(), canceled, reason)
            .await?;
        info!(final_event, turns, cost = usage.cost_usd, "worker finished");

        Ok(WorkerOutcome {
            final_event: final_event.to_string(),
            turns,
            usage,
            session_id,
            canceled,
        })
    }

    /// One agent turn: deliver the prompt, pump every block to the
    /// reporter (tool results enriched with unified diffs), return the
    /// concatenated text.
    async fn run_turn(
        &self,
        session: &mut dyn AgentSession,
        prompt: &str,
    ) -> DomainResult<String> {
        session.send_user(prompt).await?;

        let mut text = String::new();
        while let Some(block) = session.next_block().await? {
            let (event_type, data) = match &block {
                AgentBlock::Text { text: t } => {
                    text.push_str(t);
                    (event_types::AGENT_TEXT, json!({"text": t}))
                }
                AgentBlock::Thinking { text: t } => {
                    (event_types::AGENT_THINKING, json!({"text": t}))
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
                    file_change,
                } => {
                    let mut data = json!({
                        "tool_use_id": tool_use_id,
                        "output": output,
                        "is_error": is_error,
                    });
                    if let Some(change) = file_change {
                        if !diff::is_noop(change) {
                            data["file_change"] = json!({
                                "path": change.path,
                                "diff": diff::unified_diff(change),
                            });
                        }
                    }
                    (event_types::AGENT_TOOL_RESULT, data)
                }
            };
            self.emit(event_type, data).await?;
        }
        Ok(text)
    }

    /// First cap that is exceeded, if any.
    fn cap_exceeded(
        &self,
        turns: u32,
        usage: &TurnUsage,
        started: Instant,
    ) -> Option<&'static str> {
        if turns >= self.config.max_turns {
            return Some("max_turns");
        }
        if usage.cost_usd >= self.config.max_budget_usd {
            return Some("max_budget_usd");
        }
        if started.elapsed().as_secs() >= self.config.max_duration_s {
            return Some("max_duration_s");
        }
        None
    }

    async fn validate_spec_output(&self) -> DomainResult<()> {
        let set = ArtifactSet::load(&self.config.output_directory).await?;
        let report = set.validate();
        if report.is_valid() {
            Ok(())
        } else {
            Err(DomainError::ValidationFailed(
                report
                    .errors
                    .iter()
                    .map(|e| e.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            ))
        }
    }

    // -------------------------------------------------------------------
    // Spec workflow mode
    // -------------------------------------------------------------------

    async fn run_spec_workflow(&self) -> DomainResult<WorkerOutcome> {
        let spec_id = self
            .config
            .spec_id
            .ok_or_else(|| DomainError::ValidationFailed("spec_id required".to_string()))?;

        let mut spec = Spec::new(
            self.config
                .spec_title
                .clone()
                .unwrap_or_else(|| "Untitled Spec".to_string()),
            self.config.spec_description.clone().unwrap_or_default(),
        );
        spec.id = spec_id;

        // Hydrate from a previous sandbox's checkpoint.
        let phase_context = self.config.decode_phase_context()?;
        if let Some(map) = phase_context.as_object() {
            for (phase_name, output) in map {
                spec.phase_data.insert(phase_name.clone(), output.clone());
            }
        }
        let resume_phase = self.config.spec_phase.as_deref().and_then(SpecPhase::from_str);
        if let Some(phase) = resume_phase {
            spec.current_phase = phase;
        } else {
            // First phase without frozen data.
            spec.current_phase = SpecPhase::WORKFLOW
                .iter()
                .copied()
                .find(|p| !spec.phase_data.contains_key(p.as_str()))
                .unwrap_or(SpecPhase::Complete);
        }

        let executor = self.spec_executor.clone().unwrap_or_else(|| {
            Arc::new(AgentPhaseExecutor::new(
                self.driver.clone(),
                self.reporter.clone(),
                self.config.sandbox_id.clone(),
                self.config.model.clone(),
            ))
        });
        let evaluator = self
            .spec_evaluator
            .clone()
            .unwrap_or_else(|| Arc::new(StructuralEvaluator::new()));

        let machine = SpecStateMachine::new(
            spec,
            executor,
            evaluator,
            self.reporter.clone(),
            SpecMachineConfig {
                max_attempts_per_phase: 3,
                single_phase: resume_phase,
                output_dir: self.config.output_directory.clone(),
                sandbox_id: self.config.sandbox_id.clone(),
            },
        );

        let outcome = machine.run().await?;

        // Final phase_data upload for orchestrator-side checkpointing.
        self.api
            .post_sync_summary(&SyncSummary {
                spec_id,
                phase_data: outcome.spec.accumulated_context(),
                total_cost_usd: outcome.total_usage.cost_usd,
                session_id: None,
            })
            .await?;

        let final_event = if outcome.success {
            event_types::AGENT_COMPLETED
        } else {
            event_types::AGENT_FAILED
        };
        self.emit_terminal(
            final_event,
            0,
            outcome.total_usage,
            None,
            false,
            outcome.spec.last_error.clone(),
        )
        .await?;

        Ok(WorkerOutcome {
            final_event: final_event.to_string(),
            turns: 0,
            usage: outcome.total_usage,
            session_id: None,
            canceled: false,
        })
    }

    // -------------------------------------------------------------------
    // Event helpers
    // -------------------------------------------------------------------

    async fn emit(&self, event_type: &str, data: serde_json::Value) -> DomainResult<()> {
        let mut event = SandboxEvent::new(
            &self.config.sandbox_id,
            event_type,
            data,
            EventSource::Worker,
        );
        if let Some(spec_id) = self.config.spec_id {
            event = event.with_spec(spec_id);
        }
        self.reporter.report(event).await
    }

    async fn emit_terminal(
        &self,
        event_type: &str,
        turns: u32,
        usage: TurnUsage,
        session_id: Option<&str>,
        canceled: bool,
        reason: Option<String>,
    ) -> DomainResult<()> {
        self.emit(
            event_type,
            json!({
                "task_id": self.config.task_id,
                "spec_id": self.config.spec_id,
                "turns": turns,
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_cost_usd": usage.cost_usd,
                "session_id": session_id,
                "canceled": canceled,
                "reason": reason,
            }),
        )
        .await?;
        self.reporter.flush().await
    }
}
