//! The five-phase spec state machine.
//!
//! EXPLORE → REQUIREMENTS → DESIGN → TASKS → SYNC, with a terminal
//! COMPLETE. Each phase is executed by an executor that writes structured
//! output to `<output>/<phase>.json`, scored by an evaluator (threshold
//! 0.7), retried with feedback up to `max_attempts_per_phase`, and
//! checkpointed so a fresh sandbox can resume at the next phase. The SYNC
//! phase renders the markdown artifacts and refuses to report success
//! until the artifact graph validates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use super::artifacts::{
    self, write_artifact, ArtifactStatus, DependencyRefs, DesignFrontmatter,
    RequirementFrontmatter, TaskFrontmatter, TicketFrontmatter,
};
use super::validate::ArtifactSet;
use crate::domain::errors::DomainResult;
use crate::domain::models::event::event_types;
use crate::domain::models::{EventSource, PhaseResult, SandboxEvent, Spec, SpecPhase};
use crate::domain::ports::{
    EventReporter, PhaseContext, PhaseEvaluator, PhaseExecutor, TurnUsage,
};

/// Machine configuration.
#[derive(Debug, Clone)]
pub struct SpecMachineConfig {
    pub max_attempts_per_phase: u32,
    /// Run only this phase (resume mode); `None` runs from the spec's
    /// current phase to completion.
    pub single_phase: Option<SpecPhase>,
    pub output_dir: PathBuf,
    pub sandbox_id: String,
}

impl Default for SpecMachineConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_phase: 3,
            single_phase: None,
            output_dir: PathBuf::from(".spec-output"),
            sandbox_id: "local-sandbox".to_string(),
        }
    }
}

/// Result of a full machine run.
#[derive(Debug, Clone)]
pub struct SpecRunOutcome {
    pub success: bool,
    pub spec: Spec,
    pub phase_results: BTreeMap<String, PhaseResult>,
    pub total_usage: TurnUsage,
}

pub struct SpecStateMachine {
    spec: Spec,
    executor: Arc<dyn PhaseExecutor>,
    evaluator: Arc<dyn PhaseEvaluator>,
    reporter: Arc<dyn EventReporter>,
    config: SpecMachineConfig,
}

impl SpecStateMachine {
    pub fn new(
        spec: Spec,
        executor: Arc<dyn PhaseExecutor>,
        evaluator: Arc<dyn PhaseEvaluator>,
        reporter: Arc<dyn EventReporter>,
        config: SpecMachineConfig,
    ) -> Self {
        Self {
            spec,
            executor,
            evaluator,
            reporter,
            config,
        }
    }

    /// Run the workflow to completion (or the single configured phase).
    pub async fn run(mut self) -> DomainResult<SpecRunOutcome> {
        self.emit(
            event_types::SPEC_STARTED,
            json!({
                "title": self.spec.title,
                "description": self.spec.description,
                "current_phase": self.spec.current_phase.as_str(),
            }),
        )
        .await?;

        let phases: Vec<SpecPhase> = match self.config.single_phase {
            Some(phase) => vec![phase],
            None => SpecPhase::WORKFLOW
                .iter()
                .copied()
                .filter(|p| *p >= self.spec.current_phase)
                .collect(),
        };

        let mut phase_results = BTreeMap::new();
        let mut total_usage = TurnUsage::default();

        for phase in phases {
            let result = self.run_phase(phase, &mut total_usage).await?;
            let passed = result.success;
            phase_results.insert(phase.as_str().to_string(), result);

            if !passed {
                self.emit(
                    event_types::SPEC_FAILED,
                    json!({
                        "phase": phase.as_str(),
                        "attempts": self.spec.attempts_for(phase),
                        "error": self.spec.last_error,
                    }),
                )
                .await?;
                self.reporter.flush().await?;
                return Ok(SpecRunOutcome {
                    success: false,
                    spec: self.spec,
                    phase_results,
                    total_usage,
                });
            }
        }

        self.emit(
            event_types::SPEC_COMPLETED,
            json!({
                "phase_data": self.spec.accumulated_context(),
                "total_cost_usd": total_usage.cost_usd,
            }),
        )
        .await?;
        self.reporter.flush().await?;

        Ok(SpecRunOutcome {
            success: true,
            spec: self.spec,
            phase_results,
            total_usage,
        })
    }

    /// Execute one phase with evaluation retries.
    pub async fn run_phase(
        &mut self,
        phase: SpecPhase,
        total_usage: &mut TurnUsage,
    ) -> DomainResult<PhaseResult> {
        let started = Instant::now();
        let mut feedback: Option<String> = None;
        let mut retries = 0u32;

        loop {
            self.emit(
                event_types::PHASE_STARTED,
                json!({
                    "phase": phase.as_str(),
                    "attempt": self.spec.attempts_for(phase) + 1,
                }),
            )
            .await?;

            let context = PhaseContext {
                spec_id: self.spec.id,
                spec_title: self.spec.title.clone(),
                spec_description: self.spec.description.clone(),
                accumulated: self.spec.accumulated_context(),
                feedback: feedback.clone(),
                output_dir: self.config.output_dir.clone(),
            };

            let execution = match self.executor.execute_phase(phase, &context).await {
                Ok(execution) => execution,
                Err(err) => {
                    self.spec.record_attempt(phase, Some(err.to_string()));
                    if self.spec.attempts_for(phase) >= self.config.max_attempts_per_phase {
                        return Ok(self.failed_result(phase, retries, started, err.to_string()));
                    }
                    retries += 1;
                    feedback = Some(format!("previous attempt errored: {err}"));
                    continue;
                }
            };
            total_usage.add(execution.usage);

            // The machine reads the structured output file, never chat text.
            let raw = tokio::fs::read_to_string(&execution.output_path).await?;
            let output: serde_json::Value = serde_json::from_str(&raw)?;

            let mut eval = self
                .evaluator
                .evaluate(phase, &output, &context.accumulated)
                .await?;

            // SYNC must also materialize and validate the artifact graph.
            if eval.passed && phase == SpecPhase::Sync {
                if let Some(validation_feedback) = self.sync_artifacts(&output).await? {
                    eval.passed = false;
                    eval.feedback = Some(validation_feedback);
                }
            }

            self.emit(
                "spec.eval_result",
                json!({
                    "phase": phase.as_str(),
                    "score": eval.score,
                    "passed": eval.passed,
                    "feedback": eval.feedback,
                }),
            )
            .await?;

            if eval.passed {
                self.spec.record_attempt(phase, None);
                self.spec
                    .complete_phase(phase, output, execution.transcript_b64.clone())?;
                let duration = started.elapsed().as_secs_f64();
                self.emit(
                    event_types::PHASE_COMPLETED,
                    json!({
                        "phase": phase.as_str(),
                        "eval_score": eval.score,
                        "duration_seconds": duration,
                        "attempts": self.spec.attempts_for(phase),
                        "checkpoint": {
                            "phase_data": self.spec.accumulated_context(),
                            "last_checkpoint_at": self.spec.last_checkpoint_at,
                        },
                    }),
                )
                .await?;
                info!(phase = phase.as_str(), score = eval.score, "phase completed");

                return Ok(PhaseResult {
                    phase,
                    success: true,
                    eval_score: Some(eval.score),
                    duration_seconds: Some(duration),
                    output: Some(self.spec.phase_data[phase.as_str()].clone()),
                    error: None,
                    retry_count: retries,
                });
            }

            // Failed evaluation: consume an attempt and retry with feedback.
            let eval_feedback = eval
                .feedback
                .clone()
                .unwrap_or_else(|| format!("score {:.2} below threshold", eval.score));
            self.spec.record_attempt(phase, Some(eval_feedback.clone()));
            warn!(
                phase = phase.as_str(),
                score = eval.score,
                attempts = self.spec.attempts_for(phase),
                "phase evaluation failed"
            );

            if self.spec.attempts_for(phase) >= self.config.max_attempts_per_phase {
                return Ok(self.failed_result(phase, retries, started, eval_feedback));
            }

            retries += 1;
            feedback = Some(eval_feedback);
            self.emit(
                event_types::PHASE_RETRY,
                json!({
                    "phase": phase.as_str(),
                    "attempt": self.spec.attempts_for(phase),
                    "feedback": feedback,
                }),
            )
            .await?;
        }
    }

    /// Render the markdown artifacts from the accumulated context and the
    /// SYNC output, then validate the whole graph. Returns feedback on
    /// validation failure.
    async fn sync_artifacts(
        &self,
        sync_output: &serde_json::Value,
    ) -> DomainResult<Option<String>> {
        let accumulated = self.spec.accumulated_context();
        let [req_dir, design_dir, task_dir, ticket_dir] =
            artifacts::artifact_dirs(&self.config.output_dir);

        if let Some(requirements) = accumulated
            .get("requirements")
            .and_then(|v| v.get("requirements"))
            .and_then(|v| v.as_array())
        {
            for req in requirements {
                let frontmatter = RequirementFrontmatter {
                    id: req["id"].as_str().unwrap_or_default().to_string(),
                    title: req["title"].as_str().unwrap_or_default().to_string(),
                    status: ArtifactStatus::Draft,
                    priority: req["priority"].as_str().map(str::to_string),
                };
                let body = req["statement"].as_str().unwrap_or_default();
                let path = write_artifact(&req_dir, &frontmatter.id, &frontmatter, body).await?;
                self.emit_artifact(&path).await?;
            }
        }

        if let Some(design) = accumulated.get("design") {
            let components = design
                .get("components")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for component in &components {
                let frontmatter = DesignFrontmatter {
                    id: component["id"].as_str().unwrap_or_default().to_string(),
                    title: component["name"].as_str().unwrap_or_default().to_string(),
                    status: ArtifactStatus::Draft,
                    requirements: string_list(component.get("requirements")),
                };
                let mut body = component["responsibility"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                if let Some(diagram) = design.get("diagram").and_then(|v| v.as_str()) {
                    body.push_str("\n\n```mermaid\n");
                    body.push_str(diagram);
                    body.push_str("\n```\n");
                }
                let path =
                    write_artifact(&design_dir, &frontmatter.id, &frontmatter, &body).await?;
                self.emit_artifact(&path).await?;
            }
        }

        if let Some(tasks) = accumulated
            .get("tasks")
            .and_then(|v| v.get("tasks"))
            .and_then(|v| v.as_array())
        {
            for task in tasks {
                let frontmatter = TaskFrontmatter {
                    id: task["id"].as_str().unwrap_or_default().to_string(),
                    title: task["title"].as_str().unwrap_or_default().to_string(),
                    status: ArtifactStatus::Draft,
                    requirements: string_list(task.get("requirements")),
                    design_refs: string_list(task.get("design_refs")),
                    dependencies: DependencyRefs {
                        blocked_by: string_list(task.get("depends_on")),
                        blocks: Vec::new(),
                    },
                    ticket: None,
                    owned_files: string_list(task.get("owned_files")),
                };
                let body = task["description"].as_str().unwrap_or_default();
                let path = write_artifact(&task_dir, &frontmatter.id, &frontmatter, body).await?;
                self.emit_artifact(&path).await?;
            }
        }

        if let Some(tickets) = sync_output.get("tickets").and_then(|v| v.as_array()) {
            for ticket in tickets {
                let deps = ticket.get("dependencies");
                let frontmatter = TicketFrontmatter {
                    id: ticket["id"].as_str().unwrap_or_default().to_string(),
                    title: ticket["title"].as_str().unwrap_or_default().to_string(),
                    status: ArtifactStatus::Draft,
                    dependencies: DependencyRefs {
                        blocked_by: string_list(deps.and_then(|d| d.get("blocked_by"))),
                        blocks: string_list(deps.and_then(|d| d.get("blocks"))),
                    },
                };
                let path =
                    write_artifact(&ticket_dir, &frontmatter.id, &frontmatter, "").await?;
                self.emit_artifact(&path).await?;
            }
        }

        let set = ArtifactSet::load(&self.config.output_dir).await?;
        let report = set.validate();
        if report.is_valid() {
            Ok(None)
        } else {
            let summary = report
                .errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            Ok(Some(format!("artifact validation failed: {summary}")))
        }
    }

    fn failed_result(
        &self,
        phase: SpecPhase,
        retries: u32,
        started: Instant,
        error: String,
    ) -> PhaseResult {
        PhaseResult {
            phase,
            success: false,
            eval_score: None,
            duration_seconds: Some(started.elapsed().as_secs_f64()),
            output: None,
            error: Some(error),
            retry_count: retries,
        }
    }

    async fn emit(&self, event_type: &str, data: serde_json::Value) -> DomainResult<()> {
        self.reporter
            .report(
                SandboxEvent::new(
                    &self.config.sandbox_id,
                    event_type,
                    data,
                    EventSource::Worker,
                )
                .with_spec(self.spec.id),
            )
            .await
    }

    async fn emit_artifact(&self, path: &std::path::Path) -> DomainResult<()> {
        self.emit(
            event_types::ARTIFACT_CREATED,
            json!({"path": path.display().to_string()}),
        )
        .await
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
