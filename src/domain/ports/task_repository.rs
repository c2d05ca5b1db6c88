//! Task repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub ticket_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub sandbox_id: Option<String>,
    pub limit: Option<usize>,
}

/// Repository interface for Task persistence.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Update with optimistic locking: fails with `StaleWrite` when the
    /// stored version differs from `expected_version`.
    async fn update_with_version_check(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> DomainResult<()>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>>;

    /// Sibling tasks sharing a parent.
    async fn list_siblings(&self, parent_task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Tasks that list `task_id` in their `depends_on`.
    async fn list_dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// How many downstream tasks are transitively gated on `task_id`.
    async fn count_downstream_blocked(&self, task_id: Uuid) -> DomainResult<u64>;

    /// Semantically similar tasks by embedding, best first. Results are a
    /// hint only; callers must confirm duplicates with an exact rule
    /// before acting on them.
    async fn find_similar(&self, embedding: &[f32], limit: usize)
        -> DomainResult<Vec<(Task, f64)>>;
}
