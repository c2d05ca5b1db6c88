//! Orchestrator worker: drains the scheduler and dispatches tasks into
//! sandboxes.
//!
//! For each assignment it acquires a sandbox (with bounded exponential
//! backoff and jitter), registers the agent, uploads the worker bundle,
//! starts the sandbox worker with an injected callback URL, and records
//! the binding on the task. Incoming sandbox events are deduplicated,
//! persisted, forwarded to the event bus, and folded back into task and
//! agent state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::{OrchestratorConfig, RetryConfig, SandboxProviderConfig};
use crate::domain::models::event::event_types;
use crate::domain::models::{
    Agent, AgentStatus, EntityType, EventEnvelope, FailureKind, ResourceEnvelope, SandboxEvent,
    Task, TaskStatus,
};
use crate::domain::ports::{
    AgentRepository, EventRepository, Sandbox, SandboxProvider, TaskRepository,
};
use crate::services::event_bus::EventBus;
use crate::services::scheduler::TaskScheduler;

/// Files uploaded into every sandbox before the worker starts.
pub type WorkerBundle = HashMap<String, Vec<u8>>;

/// The orchestrator worker (C5).
pub struct OrchestratorWorker {
    scheduler: Arc<TaskScheduler>,
    task_repo: Arc<dyn TaskRepository>,
    agent_repo: Arc<dyn AgentRepository>,
    event_repo: Arc<dyn EventRepository>,
    provider: Arc<dyn SandboxProvider>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    retry: RetryConfig,
    sandbox_config: SandboxProviderConfig,
    callback_url: String,
    bundle: WorkerBundle,
}

impl OrchestratorWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        task_repo: Arc<dyn TaskRepository>,
        agent_repo: Arc<dyn AgentRepository>,
        event_repo: Arc<dyn EventRepository>,
        provider: Arc<dyn SandboxProvider>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
        retry: RetryConfig,
        sandbox_config: SandboxProviderConfig,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            scheduler,
            task_repo,
            agent_repo,
            event_repo,
            provider,
            bus,
            config,
            retry,
            sandbox_config,
            callback_url: callback_url.into(),
            bundle: WorkerBundle::new(),
        }
    }

    pub fn with_bundle(mut self, bundle: WorkerBundle) -> Self {
        self.bundle = bundle;
        self
    }

    /// Cooperative main loop; exits when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DomainResult<()> {
        info!("orchestrator worker started");
        loop {
            if *shutdown.borrow() {
                info!("orchestrator worker stopping");
                return Ok(());
            }

            match self.run_once().await {
                Ok(true) => {} // dispatched; try the next one immediately
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "orchestrator cycle failed");
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }
    }

    /// One cycle: ask the scheduler for an assignment and dispatch it.
    pub async fn run_once(&self) -> DomainResult<bool> {
        let running = self
            .agent_repo
            .list_by_status(AgentStatus::Running)
            .await?
            .len();
        if running >= self.config.max_agents {
            return Ok(false);
        }

        let Some(task) = self.scheduler.next_assignment().await? else {
            return Ok(false);
        };
        self.dispatch(task).await?;
        Ok(true)
    }

    /// Dispatch one assigned task into a sandbox.
    async fn dispatch(&self, mut task: Task) -> DomainResult<()> {
        let sandbox = match self.acquire_sandbox(&task).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "sandbox acquisition exhausted");
                task.fail(FailureKind::SandboxUnavailable, "sandbox_unavailable")?;
                self.task_repo
                    .update_with_version_check(&task, task.version - 1)
                    .await?;
                self.scheduler.handle_failure(task.id).await?;
                return Ok(());
            }
        };

        // Register the agent for this conversation.
        let mut agent = Agent::new(format!("agent-{}", &sandbox.id), "coder")
            .with_sandbox(sandbox.id.clone());
        self.agent_repo.create(&agent).await?;
        agent.transition_to(AgentStatus::Idle)?;
        self.agent_repo
            .update_with_version_check(&agent, agent.version - 1)
            .await?;
        agent.assign_task(task.id)?;
        self.agent_repo
            .update_with_version_check(&agent, agent.version - 1)
            .await?;

        // Upload the worker bundle and task context.
        if !self.bundle.is_empty() {
            self.provider
                .upload_files(&sandbox, self.bundle.clone())
                .await?;
        }

        // Start the worker with the injected callback URL and task context.
        let env = self.worker_env(&task, &agent, &sandbox);
        let exec = self
            .provider
            .exec(&sandbox, "foreman worker run", env)
            .await?;
        if !exec.success() {
            warn!(task_id = %task.id, stderr = %exec.stderr, "worker start failed");
            task.fail(FailureKind::Transient, "worker_start_failed")?;
            self.task_repo
                .update_with_version_check(&task, task.version - 1)
                .await?;
            self.provider.delete(&sandbox.id).await?;
            self.scheduler.handle_failure(task.id).await?;
            return Ok(());
        }

        // Record the binding and move the task to Running.
        task.sandbox_id = Some(sandbox.id.clone());
        task.assigned_agent = Some(agent.id);
        task.transition_to(TaskStatus::Running)?;
        self.task_repo
            .update_with_version_check(&task, task.version - 1)
            .await?;

        self.bus
            .publish(EventEnvelope::new(
                "task.started",
                EntityType::Task,
                task.id.to_string(),
                json!({
                    "sandbox_id": sandbox.id,
                    "agent_id": agent.id,
                }),
            ))
            .await?;

        info!(task_id = %task.id, sandbox_id = %sandbox.id, "task dispatched");
        Ok(())
    }

    /// Acquire a sandbox with exponential backoff and jitter.
    async fn acquire_sandbox(&self, task: &Task) -> DomainResult<Sandbox> {
        let mut labels = HashMap::new();
        labels.insert("task_id".to_string(), task.id.to_string());
        if let Some(ticket_id) = task.ticket_id {
            labels.insert("ticket_id".to_string(), ticket_id.to_string());
        }

        let mut delay_ms = self.retry.initial_backoff_ms;
        let mut last_err = None;

        for attempt in 1..=self.config.sandbox_acquire_attempts {
            match self
                .provider
                .create_sandbox(
                    &self.sandbox_config.image,
                    ResourceEnvelope::default(),
                    labels.clone(),
                )
                .await
            {
                Ok(sandbox) => return Ok(sandbox),
                Err(err) if err.is_transient() => {
                    let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
                    debug!(
                        attempt,
                        delay_ms = delay_ms + jitter,
                        error = %err,
                        "sandbox acquisition retry"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.retry.max_backoff_ms);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| DomainError::Provider("sandbox_unavailable".to_string())))
    }

    /// Environment handed to the sandbox worker process.
    fn worker_env(&self, task: &Task, agent: &Agent, sandbox: &Sandbox) -> HashMap<String, String> {
        use base64::Engine;
        let context = json!({
            "task_id": task.id,
            "ticket_id": task.ticket_id,
            "title": task.title,
            "description": task.description,
            "synthesis_context": task.synthesis_context,
        });
        let context_b64 =
            base64::engine::general_purpose::STANDARD.encode(context.to_string());

        let mut env = HashMap::new();
        env.insert("SANDBOX_ID".to_string(), sandbox.id.clone());
        env.insert("CALLBACK_URL".to_string(), self.callback_url.clone());
        env.insert("TASK_ID".to_string(), task.id.to_string());
        env.insert("AGENT_ID".to_string(), agent.id.to_string());
        env.insert("TASK_DATA_BASE64".to_string(), context_b64);
        // Convergence merges expect sibling work on task/<id> branches.
        env.insert("BRANCH_NAME".to_string(), format!("task/{}", task.id));
        env.insert(
            "MAX_TURNS".to_string(),
            task.execution_config.max_turns.to_string(),
        );
        env.insert(
            "MAX_BUDGET_USD".to_string(),
            task.execution_config.max_budget_usd.to_string(),
        );
        env.insert(
            "MAX_DURATION_S".to_string(),
            task.execution_config.max_duration_secs.to_string(),
        );
        env.insert(
            "PERMISSION_MODE".to_string(),
            task.execution_config.permission_mode.as_str().to_string(),
        );
        if let Some(model) = &task.execution_config.model {
            env.insert("MODEL".to_string(), model.clone());
        }
        if !task.execution_config.allowed_tools.is_empty() {
            env.insert(
                "ALLOWED_TOOLS".to_string(),
                task.execution_config.allowed_tools.join(","),
            );
        }
        if task.execution_config.continuous {
            env.insert("CONTINUOUS_MODE".to_string(), "true".to_string());
        }
        if task.execution_config.require_spec_skill {
            env.insert("REQUIRE_SPEC_SKILL".to_string(), "true".to_string());
        }
        env
    }

    /// Ingest one sandbox event: dedup, persist, forward, and fold
    /// terminal events back into task/agent state.
    pub async fn ingest_event(&self, event: SandboxEvent) -> DomainResult<()> {
        // Idempotent by (sandbox_id, id): replays do not re-apply.
        if !self.event_repo.append(&event).await? {
            debug!(event_id = %event.id, "duplicate sandbox event ignored");
            return Ok(());
        }

        self.bus
            .publish(EventEnvelope::new(
                event.event_type.clone(),
                EntityType::Sandbox,
                event.sandbox_id.clone(),
                event.event_data.clone(),
            ))
            .await?;

        match event.event_type.as_str() {
            event_types::AGENT_COMPLETED => {
                self.finish_task(&event, TaskStatus::Succeeded, None).await?;
            }
            event_types::AGENT_FAILED => {
                let kind = event
                    .event_data
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .and_then(FailureKind::from_str)
                    .unwrap_or(FailureKind::Permanent);
                self.finish_task(&event, TaskStatus::Failed, Some(kind)).await?;
            }
            event_types::AGENT_BUDGET_EXHAUSTED => {
                self.finish_task(&event, TaskStatus::Failed, Some(FailureKind::Permanent))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        event: &SandboxEvent,
        status: TaskStatus,
        kind: Option<FailureKind>,
    ) -> DomainResult<()> {
        let Some(task_id) = event
            .event_data
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            warn!(event_id = %event.id, "terminal event without task_id");
            return Ok(());
        };
        let Some(mut task) = self.task_repo.get(task_id).await? else {
            return Ok(());
        };
        if task.is_terminal() {
            return Ok(());
        }

        match status {
            TaskStatus::Succeeded => task.transition_to(TaskStatus::Succeeded)?,
            TaskStatus::Failed => task.fail(
                kind.unwrap_or(FailureKind::Permanent),
                event
                    .event_data
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported failure"),
            )?,
            _ => return Ok(()),
        }
        self.task_repo
            .update_with_version_check(&task, task.version - 1)
            .await?;

        // Return the agent to rotation.
        if let Some(agent_id) = task.assigned_agent {
            if let Some(mut agent) = self.agent_repo.get(agent_id).await? {
                if agent.can_transition_to(AgentStatus::Idle) {
                    agent.transition_to(AgentStatus::Idle)?;
                    self.agent_repo
                        .update_with_version_check(&agent, agent.version - 1)
                        .await?;
                }
            }
        }

        match status {
            TaskStatus::Succeeded => self.scheduler.handle_success(task.id).await?,
            TaskStatus::Failed => self.scheduler.handle_failure(task.id).await?,
            _ => {}
        }
        Ok(())
    }

    /// Tear down a sandbox after its task finished (idempotent).
    pub async fn release_sandbox(&self, sandbox_id: &str) -> DomainResult<()> {
        self.provider.delete(sandbox_id).await
    }
}
