//! Dynamic score-based task scheduler.
//!
//! Ready tasks sit in a priority heap keyed by `(−score, created_at, id)`.
//! The score combines base priority, age, deadline urgency, downstream
//! blocked count, and a retry penalty; it is recomputed at admission and on
//! any dependency change. At pop time the scheduler re-verifies dependency
//! gating, capability matching, ticket approval, budget headroom, and
//! owned-file disjointness; a task failing any check is requeued with a
//! fresh score and skipped for the cycle.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::SchedulerConfig;
use crate::domain::models::{
    BudgetScope, EntityType, EventEnvelope, FailureKind, Task, TaskStatus,
};
use crate::domain::ports::{
    AgentRepository, CostRepository, TaskRepository, TicketRepository,
};
use crate::services::event_bus::EventBus;

/// Weights for the scheduling score.
#[derive(Debug, Clone)]
pub struct ScoreWeights {
    pub priority: f64,
    pub age_hours: f64,
    pub deadline_urgency: f64,
    pub downstream: f64,
    pub retry_penalty: f64,
    pub deadline_horizon_hours: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priority: 1.0,
            age_hours: 0.1,
            deadline_urgency: 2.0,
            downstream: 0.5,
            retry_penalty: 0.5,
            deadline_horizon_hours: 24.0,
        }
    }
}

impl ScoreWeights {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            priority: config.priority_weight,
            age_hours: config.age_weight,
            deadline_urgency: config.deadline_weight,
            downstream: config.downstream_weight,
            retry_penalty: config.retry_penalty,
            deadline_horizon_hours: config.deadline_horizon_hours,
        }
    }

    /// `score = w₁·priority + w₂·age_hours + w₃·deadline_urgency
    ///          + w₄·downstream_blocked − w₅·retry_count`
    ///
    /// where `deadline_urgency = max(0, 1 − (deadline − now)/horizon)`.
    pub fn compute(&self, task: &Task, downstream_blocked: u64, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - task.created_at).num_seconds().max(0) as f64 / 3600.0;

        let deadline_urgency = task.deadline.map_or(0.0, |deadline| {
            let horizon_secs = self.deadline_horizon_hours * 3600.0;
            let remaining_secs = (deadline - now).num_seconds() as f64;
            (1.0 - remaining_secs / horizon_secs).clamp(0.0, 1.0)
        });

        self.priority * task.priority_base
            + self.age_hours * age_hours
            + self.deadline_urgency * deadline_urgency
            + self.downstream * downstream_blocked as f64
            - self.retry_penalty * f64::from(task.retry_count)
    }
}

/// Heap entry ordered by `(−score, created_at, id)`.
#[derive(Debug, Clone)]
struct ReadyEntry {
    score: f64,
    created_at: DateTime<Utc>,
    id: Uuid,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher score wins; ties broken by earlier creation,
        // then lexicographic id.
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct SchedulerInner {
    heap: BinaryHeap<ReadyEntry>,
    queued: HashSet<Uuid>,
    /// Retry backoff gates: a task is not assignable before its instant.
    backoff_until: HashMap<Uuid, DateTime<Utc>>,
    /// Workspace file listing used for owned-file glob expansion.
    workspace_paths: Vec<String>,
}

/// The dynamic task scheduler (C4).
pub struct TaskScheduler {
    task_repo: Arc<dyn TaskRepository>,
    ticket_repo: Arc<dyn TicketRepository>,
    agent_repo: Arc<dyn AgentRepository>,
    cost_repo: Arc<dyn CostRepository>,
    bus: Arc<EventBus>,
    weights: ScoreWeights,
    retry_backoff: Duration,
    inner: Mutex<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        ticket_repo: Arc<dyn TicketRepository>,
        agent_repo: Arc<dyn AgentRepository>,
        cost_repo: Arc<dyn CostRepository>,
        bus: Arc<EventBus>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            task_repo,
            ticket_repo,
            agent_repo,
            cost_repo,
            bus,
            weights: ScoreWeights::from_config(config),
            retry_backoff: Duration::seconds(config.retry_backoff_secs as i64),
            inner: Mutex::new(SchedulerInner {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                backoff_until: HashMap::new(),
                workspace_paths: Vec::new(),
            }),
        }
    }

    /// Provide the workspace snapshot used for owned-file disjointness.
    pub async fn set_workspace_snapshot(&self, paths: Vec<String>) {
        self.inner.lock().await.workspace_paths = paths;
    }

    /// Admit a pending task into the ready queue, computing its score.
    pub async fn admit(&self, task_id: Uuid) -> DomainResult<()> {
        let Some(mut task) = self.task_repo.get(task_id).await? else {
            return Err(DomainError::TaskNotFound(task_id));
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        if !self.dependencies_satisfied(&task).await? {
            debug!(task_id = %task_id, "task admitted later: dependencies open");
            return Ok(());
        }

        let downstream = self.task_repo.count_downstream_blocked(task.id).await?;
        let score = self.weights.compute(&task, downstream, Utc::now());
        task.score = score;
        task.updated_at = Utc::now();
        task.version += 1;
        self.update_task_retrying(&mut task).await?;

        let mut inner = self.inner.lock().await;
        if inner.queued.insert(task.id) {
            inner.heap.push(ReadyEntry {
                score,
                created_at: task.created_at,
                id: task.id,
            });
        }
        Ok(())
    }

    /// Scan all pending tasks and admit the schedulable ones.
    pub async fn admit_pending(&self) -> DomainResult<usize> {
        let pending = self.task_repo.list_by_status(TaskStatus::Pending).await?;
        let mut admitted = 0;
        for task in pending {
            self.admit(task.id).await?;
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Pop the best admissible task and move it to `Assigned`.
    ///
    /// Returns `None` when nothing passes admission this cycle; rejected
    /// candidates are requeued with refreshed scores.
    pub async fn next_assignment(&self) -> DomainResult<Option<Task>> {
        let now = Utc::now();
        let budget_candidates = {
            let inner = self.inner.lock().await;
            inner.heap.len()
        };

        for _ in 0..budget_candidates {
            let entry = {
                let mut inner = self.inner.lock().await;
                match inner.heap.pop() {
                    Some(entry) => {
                        inner.queued.remove(&entry.id);
                        entry
                    }
                    None => return Ok(None),
                }
            };

            let Some(mut task) = self.task_repo.get(entry.id).await? else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            match self.admission_check(&task, now).await? {
                Admission::Pass => {
                    task.transition_to(TaskStatus::Assigned)?;
                    self.update_task_retrying(&mut task).await?;
                    self.publish_task_event(&task, "task.assigned", json!({})).await;
                    return Ok(Some(task));
                }
                Admission::Skip(reason) => {
                    debug!(task_id = %task.id, reason, "admission check failed, requeueing");
                    self.requeue(&mut task).await?;
                }
                Admission::Drop(reason) => {
                    debug!(task_id = %task.id, reason, "task no longer schedulable");
                }
            }
        }

        Ok(None)
    }

    /// Record a task success: refresh dependent scores, admit newly
    /// unblocked work, and emit `merge_required` when a sibling group
    /// converges.
    pub async fn handle_success(&self, task_id: Uuid) -> DomainResult<()> {
        let Some(task) = self.task_repo.get(task_id).await? else {
            return Err(DomainError::TaskNotFound(task_id));
        };

        let dependents = self.task_repo.list_dependents(task_id).await?;
        for dependent in dependents {
            // Dependency change: admission recomputes the score.
            self.admit(dependent.id).await?;
        }

        if let Some(parent_id) = task.parent_task_id {
            let siblings = self.task_repo.list_siblings(parent_id).await?;
            if !siblings.is_empty()
                && siblings.iter().all(|s| s.status == TaskStatus::Succeeded)
            {
                info!(parent_id = %parent_id, "sibling group converged, merge required");
                self.bus
                    .publish(EventEnvelope::new(
                        "task.merge_required",
                        EntityType::Task,
                        parent_id.to_string(),
                        json!({
                            "source_task_ids": siblings.iter().map(|s| s.id).collect::<Vec<_>>(),
                            "ticket_id": task.ticket_id,
                        }),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a task failure: retry transient failures with backoff,
    /// propagate terminal failures downstream as `upstream_failed`.
    pub async fn handle_failure(&self, task_id: Uuid) -> DomainResult<()> {
        let Some(mut task) = self.task_repo.get(task_id).await? else {
            return Err(DomainError::TaskNotFound(task_id));
        };

        if task.can_retry() {
            let attempt = task.retry_count + 1;
            task.retry()?;
            self.update_task_retrying(&mut task).await?;

            // Exponential backoff gate before the next admission.
            let backoff = self.retry_backoff * 2_i32.pow(attempt.saturating_sub(1).min(8));
            let until = Utc::now() + backoff;
            self.inner.lock().await.backoff_until.insert(task.id, until);
            self.admit(task.id).await?;
            self.publish_task_event(&task, "task.retrying", json!({"attempt": attempt}))
                .await;
            return Ok(());
        }

        self.publish_task_event(&task, "task.failed", json!({
            "kind": task.failure_kind.map(|k| k.as_str()),
            "reason": task.failure_reason,
        }))
        .await;
        self.propagate_upstream_failure(task_id).await
    }

    /// Cancel running/assigned tasks whose execution timeout expired.
    pub async fn enforce_timeouts(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let mut canceled = 0;
        for status in [TaskStatus::Assigned, TaskStatus::Running] {
            for mut task in self.task_repo.list_by_status(status).await? {
                let Some(timeout) = task.timeout_seconds else {
                    continue;
                };
                let anchor = task.started_at.unwrap_or(task.updated_at);
                if now - anchor > Duration::seconds(timeout as i64) {
                    task.failure_kind = Some(FailureKind::DeadlineExceeded);
                    task.failure_reason = Some("deadline_exceeded".to_string());
                    task.transition_to(TaskStatus::Canceled)?;
                    self.update_task_retrying(&mut task).await?;
                    self.publish_task_event(&task, "task.canceled", json!({
                        "reason": "deadline_exceeded",
                    }))
                    .await;
                    canceled += 1;
                }
            }
        }
        Ok(canceled)
    }

    // -------------------------------------------------------------------
    // Admission checks
    // -------------------------------------------------------------------

    async fn admission_check(&self, task: &Task, now: DateTime<Utc>) -> DomainResult<Admission> {
        // Retry backoff gate.
        {
            let inner = self.inner.lock().await;
            if let Some(until) = inner.backoff_until.get(&task.id) {
                if *until > now {
                    return Ok(Admission::Skip("retry_backoff"));
                }
            }
        }

        // (a) every blocked_by task succeeded
        if !self.dependencies_satisfied(task).await? {
            if self.has_failed_dependency(task).await? {
                return Ok(Admission::Drop("upstream_failed"));
            }
            return Ok(Admission::Skip("dependencies_open"));
        }

        // (d) referenced ticket approved and not blocked
        if let Some(ticket_id) = task.ticket_id {
            let Some(ticket) = self.ticket_repo.get(ticket_id).await? else {
                return Ok(Admission::Drop("ticket_missing"));
            };
            if !ticket.is_schedulable() {
                return Ok(Admission::Skip("ticket_not_schedulable"));
            }
        }

        // (b) at least one IDLE agent satisfies required_capabilities
        let idle_agents = self
            .agent_repo
            .list_by_status(crate::domain::models::AgentStatus::Idle)
            .await?;
        if !idle_agents
            .iter()
            .any(|agent| agent.satisfies(&task.required_capabilities))
        {
            return Ok(Admission::Skip("no_capable_idle_agent"));
        }

        // (c) budget scope has headroom
        if let Some(budget) = self
            .cost_repo
            .get_budget(BudgetScope::Task, &task.id.to_string())
            .await?
        {
            if budget.remaining() <= 0.0 {
                return Ok(Admission::Skip("budget_exhausted"));
            }
        }

        // Invariant 7: owned files disjoint from running siblings.
        if !self.owned_files_disjoint(task).await? {
            return Ok(Admission::Skip("owned_files_overlap"));
        }

        Ok(Admission::Pass)
    }

    async fn dependencies_satisfied(&self, task: &Task) -> DomainResult<bool> {
        for dep_id in &task.depends_on {
            let dep = self
                .task_repo
                .get(*dep_id)
                .await?
                .ok_or(DomainError::TaskNotFound(*dep_id))?;
            if dep.status != TaskStatus::Succeeded {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn has_failed_dependency(&self, task: &Task) -> DomainResult<bool> {
        for dep_id in &task.depends_on {
            if let Some(dep) = self.task_repo.get(*dep_id).await? {
                if matches!(dep.status, TaskStatus::Failed | TaskStatus::Canceled) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Expand each glob over the workspace snapshot and require pairwise
    /// disjoint file sets with every running sibling.
    async fn owned_files_disjoint(&self, task: &Task) -> DomainResult<bool> {
        let Some(parent_id) = task.parent_task_id else {
            return Ok(true);
        };
        if task.owned_files.is_empty() {
            return Ok(true);
        }

        let workspace = {
            let inner = self.inner.lock().await;
            inner.workspace_paths.clone()
        };
        let candidate_files = expand_globs(&task.owned_files, &workspace);

        for sibling in self.task_repo.list_siblings(parent_id).await? {
            if sibling.id == task.id
                || !matches!(sibling.status, TaskStatus::Assigned | TaskStatus::Running)
            {
                continue;
            }
            let sibling_files = expand_globs(&sibling.owned_files, &workspace);
            if candidate_files.intersection(&sibling_files).next().is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    async fn requeue(&self, task: &mut Task) -> DomainResult<()> {
        let downstream = self.task_repo.count_downstream_blocked(task.id).await?;
        let score = self.weights.compute(task, downstream, Utc::now());
        task.score = score;
        task.updated_at = Utc::now();
        task.version += 1;
        self.update_task_retrying(task).await?;

        let mut inner = self.inner.lock().await;
        if inner.queued.insert(task.id) {
            inner.heap.push(ReadyEntry {
                score,
                created_at: task.created_at,
                id: task.id,
            });
        }
        Ok(())
    }

    /// Mark every transitive dependent failed with `upstream_failed`.
    async fn propagate_upstream_failure(&self, failed_id: Uuid) -> DomainResult<()> {
        let mut frontier = vec![failed_id];
        let mut seen = HashSet::new();

        while let Some(current) = frontier.pop() {
            if !seen.insert(current) {
                continue;
            }
            for mut dependent in self.task_repo.list_dependents(current).await? {
                if dependent.is_terminal() {
                    continue;
                }
                dependent.failure_kind = Some(FailureKind::UpstreamFailed);
                dependent.failure_reason = Some(format!("upstream task {current} failed"));
                // Pending/Assigned tasks move straight to Failed.
                if dependent.can_transition_to(TaskStatus::Failed) {
                    dependent.transition_to(TaskStatus::Failed)?;
                    self.update_task_retrying(&mut dependent).await?;
                    self.publish_task_event(&dependent, "task.failed", json!({
                        "kind": "upstream_failed",
                        "upstream": current.to_string(),
                    }))
                    .await;
                    frontier.push(dependent.id);
                }
            }
        }
        Ok(())
    }

    /// Persist a task, silently retrying optimistic-lock conflicts by
    /// re-reading and re-applying the mutation's observable fields.
    async fn update_task_retrying(&self, task: &mut Task) -> DomainResult<()> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            let expected = task.version - 1;
            match self
                .task_repo
                .update_with_version_check(task, expected)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err @ DomainError::StaleWrite { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    if let Some(current) = self.task_repo.get(task.id).await? {
                        warn!(task_id = %task.id, "stale write, rebasing task update");
                        let mut rebased = current;
                        rebased.status = task.status;
                        rebased.score = task.score;
                        rebased.retry_count = task.retry_count;
                        rebased.failure_kind = task.failure_kind;
                        rebased.failure_reason = task.failure_reason.clone();
                        rebased.sandbox_id = task.sandbox_id.clone();
                        rebased.assigned_agent = task.assigned_agent;
                        rebased.started_at = task.started_at;
                        rebased.completed_at = task.completed_at;
                        rebased.version += 1;
                        *task = rebased;
                    } else {
                        return Err(DomainError::TaskNotFound(task.id));
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn publish_task_event(&self, task: &Task, event_type: &str, payload: serde_json::Value) {
        let envelope = EventEnvelope::new(
            event_type,
            EntityType::Task,
            task.id.to_string(),
            payload,
        );
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(task_id = %task.id, error = %err, "failed to publish task event");
        }
    }
}

enum Admission {
    Pass,
    /// Requeue with a refreshed score.
    Skip(&'static str),
    /// Leave out of the queue entirely.
    Drop(&'static str),
}

/// Expand glob patterns over a workspace file listing.
fn expand_globs(patterns: &[String], workspace: &[String]) -> HashSet<String> {
    let mut matched = HashSet::new();
    for pattern_str in patterns {
        let Ok(pattern) = glob::Pattern::new(pattern_str) else {
            continue;
        };
        for path in workspace {
            if pattern.matches(path) {
                matched.insert(path.clone());
            }
        }
    }
    matched
}
