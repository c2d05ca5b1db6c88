//! Policy-driven guardian / watchdog.
//!
//! Consumes anomaly, failure, and budget events, classifies the incident,
//! and picks a remediation along the authority ladder:
//! `nudge < pause_agent < resize_resources < restart_sandbox < terminate_agent`.
//! Actions above `auto_authority` wait for an approver; a timed-out
//! approval is never executed and the incident is re-queued with elevated
//! severity.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::GuardianConfig;
use crate::domain::models::{
    ActionStatus, AgentStatus, BudgetScope, EntityType, EventEnvelope, GuardianAction,
    GuardianActionType, ResourceEnvelope, TaskStatus,
};
use crate::domain::ports::{
    AgentRepository, AllocationRepository, GuardianRepository, TaskRepository, TicketRepository,
};
use crate::services::event_bus::{EventBus, EventStream};

/// What went wrong, from the guardian's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentKind {
    /// Sustained anomaly score above threshold
    Anomaly,
    /// Missed-heartbeat ladder reached the guardian rung
    HeartbeatSilence,
    /// Repeated transient errors on the same agent
    RepeatedErrors,
    /// Budget scope crossed its alert threshold
    CostPressure,
    /// Budget scope crossed its hard limit
    CostOverrun,
    /// Sandbox resources saturated
    ResourceSaturation,
}

/// An incident raised against an agent.
#[derive(Debug, Clone)]
pub struct Incident {
    pub agent_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub kind: IncidentKind,
    /// 1 (mild) .. 5 (severe); elevated on approval timeout re-queue
    pub severity: u8,
    pub reason: String,
}

/// The guardian service (C8).
pub struct Guardian {
    guardian_repo: Arc<dyn GuardianRepository>,
    agent_repo: Arc<dyn AgentRepository>,
    task_repo: Arc<dyn TaskRepository>,
    ticket_repo: Arc<dyn TicketRepository>,
    allocation_repo: Arc<dyn AllocationRepository>,
    bus: Arc<EventBus>,
    config: GuardianConfig,
}

impl Guardian {
    pub fn new(
        guardian_repo: Arc<dyn GuardianRepository>,
        agent_repo: Arc<dyn AgentRepository>,
        task_repo: Arc<dyn TaskRepository>,
        ticket_repo: Arc<dyn TicketRepository>,
        allocation_repo: Arc<dyn AllocationRepository>,
        bus: Arc<EventBus>,
        config: GuardianConfig,
    ) -> Self {
        Self {
            guardian_repo,
            agent_repo,
            task_repo,
            ticket_repo,
            allocation_repo,
            bus,
            config,
        }
    }

    /// Map a monitor escalation event onto an incident; `None` for event
    /// types the guardian does not consume.
    pub fn incident_from_event(event: &EventEnvelope) -> Option<Incident> {
        let agent_id = Uuid::parse_str(&event.entity_id).ok();
        match event.event_type.as_str() {
            "agent.intervention_requested" => {
                let missed = event
                    .payload
                    .get("consecutive_missed")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(4);
                Some(Incident {
                    agent_id,
                    task_id: None,
                    kind: IncidentKind::HeartbeatSilence,
                    severity: missed.min(5) as u8,
                    reason: format!("{missed} consecutive missed heartbeats"),
                })
            }
            "agent.anomaly_detected" => {
                let readings = event
                    .payload
                    .get("consecutive_readings")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(3);
                Some(Incident {
                    agent_id,
                    task_id: None,
                    kind: IncidentKind::Anomaly,
                    severity: readings.min(5) as u8,
                    reason: format!("anomaly sustained for {readings} consecutive readings"),
                })
            }
            _ => None,
        }
    }

    /// Consume one monitor escalation event; returns the recorded action
    /// when the event is one the guardian acts on.
    pub async fn handle_agent_event(
        &self,
        event: &EventEnvelope,
    ) -> DomainResult<Option<GuardianAction>> {
        match Self::incident_from_event(event) {
            Some(incident) => Ok(Some(self.handle_incident(incident).await?)),
            None => Ok(None),
        }
    }

    /// Cost intervention for a crossed budget limit: pause the running
    /// agents of the exhausted scope. The event entity id carries
    /// `scope:scope_id`.
    pub async fn handle_budget_event(
        &self,
        event: &EventEnvelope,
    ) -> DomainResult<Vec<GuardianAction>> {
        let Some((scope_str, scope_id)) = event.entity_id.split_once(':') else {
            return Ok(Vec::new());
        };
        let Some(scope) = BudgetScope::from_str(scope_str) else {
            return Ok(Vec::new());
        };
        self.pause_scope(scope, scope_id).await
    }

    /// Raise one pause incident per running agent in the scope.
    pub async fn pause_scope(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> DomainResult<Vec<GuardianAction>> {
        let mut actions = Vec::new();
        for (agent_id, task_id) in self.running_agents_in_scope(scope, scope_id).await? {
            let action = self
                .handle_incident(Incident {
                    agent_id: Some(agent_id),
                    task_id,
                    kind: IncidentKind::CostOverrun,
                    severity: 2,
                    reason: format!("budget limit crossed for {}:{scope_id}", scope.as_str()),
                })
                .await?;
            actions.push(action);
        }
        Ok(actions)
    }

    /// Running agents attributable to a budget scope, with the task they
    /// are on when known.
    async fn running_agents_in_scope(
        &self,
        scope: BudgetScope,
        scope_id: &str,
    ) -> DomainResult<Vec<(Uuid, Option<Uuid>)>> {
        match scope {
            BudgetScope::Agent => {
                let Ok(agent_id) = Uuid::parse_str(scope_id) else {
                    return Ok(Vec::new());
                };
                match self.agent_repo.get(agent_id).await? {
                    Some(agent) if agent.status == AgentStatus::Running => {
                        Ok(vec![(agent.id, agent.current_task_id)])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            BudgetScope::Task => {
                let Ok(task_id) = Uuid::parse_str(scope_id) else {
                    return Ok(Vec::new());
                };
                match self.task_repo.get(task_id).await? {
                    Some(task) if !task.is_terminal() => Ok(task
                        .assigned_agent
                        .map(|agent_id| (agent_id, Some(task.id)))
                        .into_iter()
                        .collect()),
                    _ => Ok(Vec::new()),
                }
            }
            BudgetScope::Project => {
                let Ok(project_id) = Uuid::parse_str(scope_id) else {
                    return Ok(Vec::new());
                };
                let mut affected = Vec::new();
                for task in self.task_repo.list_by_status(TaskStatus::Running).await? {
                    let Some(ticket_id) = task.ticket_id else {
                        continue;
                    };
                    let Some(ticket) = self.ticket_repo.get(ticket_id).await? else {
                        continue;
                    };
                    if ticket.project_id == Some(project_id) {
                        if let Some(agent_id) = task.assigned_agent {
                            affected.push((agent_id, Some(task.id)));
                        }
                    }
                }
                Ok(affected)
            }
            BudgetScope::Account => {
                // Account budgets cover the whole fleet this orchestrator
                // runs; every running agent is in scope.
                Ok(self
                    .agent_repo
                    .list_by_status(AgentStatus::Running)
                    .await?
                    .into_iter()
                    .map(|agent| (agent.id, agent.current_task_id))
                    .collect())
            }
        }
    }

    /// Drain monitor escalation events from the bus until shutdown.
    pub async fn run_agent_watch(
        &self,
        mut stream: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = stream.recv() => {
                    let Some(event) = event else { return };
                    if let Err(err) = self.handle_agent_event(&event).await {
                        warn!(
                            error = %err,
                            event_type = %event.event_type,
                            "agent intervention failed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Drain budget limit events from the bus until shutdown.
    pub async fn run_budget_watch(
        &self,
        mut stream: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = stream.recv() => {
                    let Some(event) = event else { return };
                    if let Err(err) = self.handle_budget_event(&event).await {
                        warn!(
                            error = %err,
                            entity_id = %event.entity_id,
                            "cost intervention failed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Classify an incident, record the chosen action, and execute it
    /// immediately when its authority allows.
    pub async fn handle_incident(&self, incident: Incident) -> DomainResult<GuardianAction> {
        let action_type = Self::classify(&incident);
        let mut action = GuardianAction::new(action_type, incident.reason.clone(), "guardian");
        if let Some(agent_id) = incident.agent_id {
            action = action.with_target_agent(agent_id);
        }
        if let Some(task_id) = incident.task_id {
            action = action.with_target_task(task_id);
        }
        self.guardian_repo.create(&action).await?;

        if action.authority_level <= self.config.auto_authority {
            action.approve("auto_policy")?;
            self.guardian_repo.update(&action).await?;
            self.execute(&mut action).await?;
        } else {
            info!(
                action_id = %action.id,
                action = action.action.as_str(),
                authority = action.authority_level,
                "guardian action awaiting approval"
            );
            self.publish("guardian.pending_review", &action).await;
        }

        Ok(action)
    }

    /// Map incident kind and severity onto the remediation ladder.
    fn classify(incident: &Incident) -> GuardianActionType {
        match incident.kind {
            IncidentKind::CostPressure => GuardianActionType::Nudge,
            IncidentKind::CostOverrun => GuardianActionType::PauseAgent,
            IncidentKind::ResourceSaturation => GuardianActionType::ResizeResources,
            IncidentKind::Anomaly | IncidentKind::RepeatedErrors => match incident.severity {
                0..=1 => GuardianActionType::Nudge,
                2 => GuardianActionType::PauseAgent,
                3 => GuardianActionType::ResizeResources,
                4 => GuardianActionType::RestartSandbox,
                _ => GuardianActionType::TerminateAgent,
            },
            IncidentKind::HeartbeatSilence => match incident.severity {
                0..=2 => GuardianActionType::Nudge,
                3..=4 => GuardianActionType::RestartSandbox,
                _ => GuardianActionType::TerminateAgent,
            },
        }
    }

    /// Record an approval and execute the action.
    pub async fn approve(&self, action_id: Uuid, approver: &str) -> DomainResult<GuardianAction> {
        let Some(mut action) = self.guardian_repo.get(action_id).await? else {
            return Err(DomainError::ValidationFailed(format!(
                "guardian action {action_id} not found"
            )));
        };
        action.approve(approver)?;
        self.guardian_repo.update(&action).await?;
        self.execute(&mut action).await?;
        Ok(action)
    }

    /// Record a rejection.
    pub async fn reject(&self, action_id: Uuid, approver: &str) -> DomainResult<GuardianAction> {
        let Some(mut action) = self.guardian_repo.get(action_id).await? else {
            return Err(DomainError::ValidationFailed(format!(
                "guardian action {action_id} not found"
            )));
        };
        action.reject(approver)?;
        self.guardian_repo.update(&action).await?;
        self.publish("guardian.rejected", &action).await;
        Ok(action)
    }

    /// Expire pending approvals past the window. Each expired incident is
    /// re-raised with elevated severity; the expired action itself is
    /// never executed.
    pub async fn expire_pending(&self) -> DomainResult<Vec<GuardianAction>> {
        let cutoff = Utc::now() - Duration::seconds(self.config.approval_timeout_secs as i64);
        let mut expired = Vec::new();

        for mut action in self
            .guardian_repo
            .list_by_status(ActionStatus::PendingReview)
            .await?
        {
            if action.created_at > cutoff {
                continue;
            }
            action.time_out()?;
            self.guardian_repo.update(&action).await?;
            self.publish("guardian.timed_out", &action).await;

            let requeued = self
                .handle_incident(Incident {
                    agent_id: action.target_agent,
                    task_id: action.target_task,
                    kind: IncidentKind::RepeatedErrors,
                    severity: (action.authority_level + 1).min(5),
                    reason: format!("approval timed out for {}", action.action.as_str()),
                })
                .await?;
            info!(
                expired = %action.id,
                requeued = %requeued.id,
                "incident re-queued after approval timeout"
            );
            expired.push(action);
        }

        Ok(expired)
    }

    /// Apply an approved action to its target.
    async fn execute(&self, action: &mut GuardianAction) -> DomainResult<()> {
        match action.action {
            GuardianActionType::Nudge => {
                // Delivery happens through the sandbox message queue; the
                // orchestrator listens for this event and enqueues the
                // guardian_nudge for injection.
                self.publish("guardian.nudge", action).await;
            }
            GuardianActionType::PauseAgent => {
                if let Some(agent_id) = action.target_agent {
                    self.transition_agent(agent_id, AgentStatus::Quarantined)
                        .await?;
                }
            }
            GuardianActionType::ResizeResources => {
                if let Some(agent_id) = action.target_agent {
                    self.stage_resize(agent_id).await?;
                }
            }
            GuardianActionType::RestartSandbox => {
                // The orchestrator owns the provider handle; it reacts to
                // this event by recycling the sandbox.
                self.publish("guardian.restart_sandbox", action).await;
            }
            GuardianActionType::TerminateAgent => {
                if let Some(agent_id) = action.target_agent {
                    self.terminate_agent(agent_id).await?;
                }
            }
        }

        action.mark_executed()?;
        self.guardian_repo.update(action).await?;
        self.publish("guardian.executed", action).await;
        Ok(())
    }

    async fn transition_agent(&self, agent_id: Uuid, target: AgentStatus) -> DomainResult<()> {
        let Some(mut agent) = self.agent_repo.get(agent_id).await? else {
            return Err(DomainError::AgentNotFound(agent_id));
        };
        if !agent.can_transition_to(target) {
            warn!(
                agent_id = %agent_id,
                from = agent.status.as_str(),
                to = target.as_str(),
                "guardian transition not legal from current status, skipping"
            );
            return Ok(());
        }
        agent.transition_to(target)?;
        self.agent_repo
            .update_with_version_check(&agent, agent.version - 1)
            .await
    }

    async fn terminate_agent(&self, agent_id: Uuid) -> DomainResult<()> {
        let Some(agent) = self.agent_repo.get(agent_id).await? else {
            return Err(DomainError::AgentNotFound(agent_id));
        };
        // Validation runs keep their agent; it still counts against
        // capacity and re-enters IDLE only via QUARANTINED.
        if agent.kept_alive_for_validation {
            info!(agent_id = %agent_id, "termination skipped: kept alive for validation");
            return self.transition_agent(agent_id, AgentStatus::Quarantined).await;
        }
        self.transition_agent(agent_id, AgentStatus::Terminated).await
    }

    /// Stage a doubled resource envelope for the agent's sandbox.
    async fn stage_resize(&self, agent_id: Uuid) -> DomainResult<()> {
        let Some(agent) = self.agent_repo.get(agent_id).await? else {
            return Err(DomainError::AgentNotFound(agent_id));
        };
        let Some(sandbox_id) = agent.sandbox_id else {
            return Ok(());
        };
        let Some(mut allocation) = self.allocation_repo.get(&sandbox_id).await? else {
            return Ok(());
        };
        let doubled = ResourceEnvelope {
            cpu_cores: allocation.current.cpu_cores * 2.0,
            memory_mb: allocation.current.memory_mb * 2,
            disk_gb: allocation.current.disk_gb,
        };
        allocation.stage_resize(doubled, "guardian");
        self.allocation_repo
            .update_with_version_check(&allocation, allocation.version - 1)
            .await
    }

    async fn publish(&self, event_type: &str, action: &GuardianAction) {
        let entity_id = action
            .target_agent
            .map_or_else(|| action.id.to_string(), |id| id.to_string());
        let envelope = EventEnvelope::new(
            event_type,
            EntityType::Agent,
            entity_id,
            json!({
                "action_id": action.id,
                "action": action.action.as_str(),
                "authority_level": action.authority_level,
                "reason": action.reason,
                "target_task": action.target_task,
            }),
        );
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(error = %err, "failed to publish guardian event");
        }
    }
}
