//! SQLite implementation of the task repository.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::{ExecutionConfig, FailureKind};
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::task_repository::{TaskFilter, TaskRepository};

use super::utils::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, parse_uuid_opt};

pub struct TaskRepositoryImpl {
    pool: SqlitePool,
}

impl TaskRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Task> {
        Ok(Task {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            ticket_id: parse_uuid_opt(row.get::<Option<String>, _>("ticket_id").as_deref())?,
            parent_task_id: parse_uuid_opt(
                row.get::<Option<String>, _>("parent_task_id").as_deref(),
            )?,
            title: row.get("title"),
            description: row.get("description"),
            status: TaskStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
                DomainError::Serialization(format!(
                    "unknown task status {}",
                    row.get::<String, _>("status")
                ))
            })?,
            priority_base: row.get("priority_base"),
            score: row.get("score"),
            deadline: parse_datetime_opt(row.get::<Option<String>, _>("deadline").as_deref())?,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            timeout_seconds: row
                .get::<Option<i64>, _>("timeout_seconds")
                .map(|v| v as u64),
            required_capabilities: parse_json(&row.get::<String, _>("required_capabilities"))?,
            depends_on: parse_json(&row.get::<String, _>("depends_on"))?,
            owned_files: parse_json(&row.get::<String, _>("owned_files"))?,
            synthesis_context: row
                .get::<Option<String>, _>("synthesis_context")
                .as_deref()
                .map(parse_json)
                .transpose()?,
            sandbox_id: row.get("sandbox_id"),
            assigned_agent: parse_uuid_opt(
                row.get::<Option<String>, _>("assigned_agent").as_deref(),
            )?,
            execution_config: parse_json::<ExecutionConfig>(
                &row.get::<String, _>("execution_config"),
            )
            .unwrap_or_default(),
            persistence_dir: row.get("persistence_dir"),
            embedding: row
                .get::<Option<String>, _>("embedding")
                .as_deref()
                .map(parse_json)
                .transpose()?,
            failure_kind: row
                .get::<Option<String>, _>("failure_kind")
                .as_deref()
                .and_then(FailureKind::from_str),
            failure_reason: row.get("failure_reason"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
            started_at: parse_datetime_opt(row.get::<Option<String>, _>("started_at").as_deref())?,
            completed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("completed_at").as_deref(),
            )?,
            version: row.get::<i64, _>("version") as u64,
        })
    }

    fn bind_task<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        task: &'q Task,
    ) -> DomainResult<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>>
    {
        Ok(query
            .bind(task.ticket_id.map(|id| id.to_string()))
            .bind(task.parent_task_id.map(|id| id.to_string()))
            .bind(&task.title)
            .bind(&task.description)
            .bind(task.status.as_str())
            .bind(task.priority_base)
            .bind(task.score)
            .bind(task.deadline.map(|d| d.to_rfc3339()))
            .bind(task.retry_count as i64)
            .bind(task.max_retries as i64)
            .bind(task.timeout_seconds.map(|t| t as i64))
            .bind(serde_json::to_string(&task.required_capabilities)?)
            .bind(serde_json::to_string(&task.depends_on)?)
            .bind(serde_json::to_string(&task.owned_files)?)
            .bind(
                task.synthesis_context
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(task.sandbox_id.as_deref())
            .bind(task.assigned_agent.map(|id| id.to_string()))
            .bind(serde_json::to_string(&task.execution_config)?)
            .bind(task.persistence_dir.as_deref())
            .bind(
                task.embedding
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(task.failure_kind.map(|k| k.as_str()))
            .bind(task.failure_reason.as_deref())
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .bind(task.started_at.map(|d| d.to_rfc3339()))
            .bind(task.completed_at.map(|d| d.to_rfc3339())))
    }
}

#[async_trait]
impl TaskRepository for TaskRepositoryImpl {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let query = sqlx::query(
            "INSERT INTO tasks (
                id, ticket_id, parent_task_id, title, description, status,
                priority_base, score, deadline, retry_count, max_retries,
                timeout_seconds, required_capabilities, depends_on, owned_files,
                synthesis_context, sandbox_id, assigned_agent, execution_config,
                persistence_dir, embedding, failure_kind, failure_reason,
                created_at, updated_at, started_at, completed_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string());
        let query = Self::bind_task(query, task)?.bind(task.version as i64);
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_with_version_check(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> DomainResult<()> {
        let query = sqlx::query(
            "UPDATE tasks SET
                ticket_id = ?, parent_task_id = ?, title = ?, description = ?,
                status = ?, priority_base = ?, score = ?, deadline = ?,
                retry_count = ?, max_retries = ?, timeout_seconds = ?,
                required_capabilities = ?, depends_on = ?, owned_files = ?,
                synthesis_context = ?, sandbox_id = ?, assigned_agent = ?,
                execution_config = ?, persistence_dir = ?, embedding = ?,
                failure_kind = ?, failure_reason = ?, created_at = ?,
                updated_at = ?, started_at = ?, completed_at = ?, version = ?
            WHERE id = ? AND version = ?",
        );
        // First placeholder block mirrors bind_task's column order.
        let query = Self::bind_task(query, task)?
            .bind(task.version as i64)
            .bind(task.id.to_string())
            .bind(expected_version as i64);

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            if self.get(task.id).await?.is_none() {
                return Err(DomainError::TaskNotFound(task.id));
            }
            return Err(DomainError::StaleWrite {
                entity: "task",
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.ticket_id.is_some() {
            sql.push_str(" AND ticket_id = ?");
        }
        if filter.parent_task_id.is_some() {
            sql.push_str(" AND parent_task_id = ?");
        }
        if filter.sandbox_id.is_some() {
            sql.push_str(" AND sandbox_id = ?");
        }
        sql.push_str(" ORDER BY created_at ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(ticket_id) = filter.ticket_id {
            query = query.bind(ticket_id.to_string());
        }
        if let Some(parent) = filter.parent_task_id {
            query = query.bind(parent.to_string());
        }
        if let Some(sandbox_id) = &filter.sandbox_id {
            query = query.bind(sandbox_id.clone());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_by_status(&self, status: TaskStatus) -> DomainResult<Vec<Task>> {
        self.list(TaskFilter {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    async fn list_siblings(&self, parent_task_id: Uuid) -> DomainResult<Vec<Task>> {
        self.list(TaskFilter {
            parent_task_id: Some(parent_task_id),
            ..Default::default()
        })
        .await
    }

    async fn list_dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        // depends_on is a JSON array of uuid strings; substring match is a
        // pre-filter, confirmed exactly after parsing.
        let rows = sqlx::query("SELECT * FROM tasks WHERE depends_on LIKE ?")
            .bind(format!("%{task_id}%"))
            .fetch_all(&self.pool)
            .await?;
        let mut dependents = Vec::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            if task.depends_on.contains(&task_id) {
                dependents.push(task);
            }
        }
        Ok(dependents)
    }

    async fn find_similar(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> DomainResult<Vec<(Task, f64)>> {
        // Cosine similarity over tasks that carry an embedding. A hint
        // only: callers confirm with exact rules before any dedup action.
        let rows = sqlx::query("SELECT * FROM tasks WHERE embedding IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(Task, f64)> = Vec::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            if let Some(candidate) = &task.embedding {
                let similarity = cosine_similarity(embedding, candidate);
                scored.push((task, similarity));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count_downstream_blocked(&self, task_id: Uuid) -> DomainResult<u64> {
        // Breadth-first over dependents; cycles are rejected at creation
        // so the frontier terminates.
        let mut seen = std::collections::HashSet::new();
        let mut frontier = vec![task_id];
        let mut count: u64 = 0;

        while let Some(current) = frontier.pop() {
            for dependent in self.list_dependents(current).await? {
                if seen.insert(dependent.id) && !dependent.is_terminal() {
                    count += 1;
                    frontier.push(dependent.id);
                }
            }
        }
        Ok(count)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::connection::DatabaseConnection;

    async fn repo() -> TaskRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        TaskRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let repo = repo().await;
        let task = Task::new("Build the parser", "Parse the frontmatter")
            .with_priority(2.5)
            .with_capabilities(vec!["rust".to_string()])
            .with_owned_files(vec!["src/**/*.rs".to_string()]);
        repo.create(&task).await.unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn test_version_check_rejects_stale_writes() {
        let repo = repo().await;
        let mut task = Task::new("t", "d");
        repo.create(&task).await.unwrap();

        task.transition_to(TaskStatus::Assigned).unwrap();
        repo.update_with_version_check(&task, task.version - 1)
            .await
            .unwrap();

        // Re-apply with the stale version.
        let err = repo
            .update_with_version_check(&task, task.version - 1)
            .await
            .map(|()| ())
            .unwrap_err();
        assert!(matches!(err, DomainError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_task_reports_not_found() {
        let repo = repo().await;
        let task = Task::new("t", "d");
        let err = repo
            .update_with_version_check(&task, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_dependents_exact_match() {
        let repo = repo().await;
        let upstream = Task::new("a", "d");
        repo.create(&upstream).await.unwrap();
        let dependent = Task::new("b", "d").with_dependency(upstream.id);
        repo.create(&dependent).await.unwrap();
        let unrelated = Task::new("c", "d");
        repo.create(&unrelated).await.unwrap();

        let dependents = repo.list_dependents(upstream.id).await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, dependent.id);
    }

    #[tokio::test]
    async fn test_count_downstream_blocked_transitive() {
        let repo = repo().await;
        let a = Task::new("a", "d");
        repo.create(&a).await.unwrap();
        let b = Task::new("b", "d").with_dependency(a.id);
        repo.create(&b).await.unwrap();
        let c = Task::new("c", "d").with_dependency(b.id);
        repo.create(&c).await.unwrap();

        assert_eq!(repo.count_downstream_blocked(a.id).await.unwrap(), 2);
        assert_eq!(repo.count_downstream_blocked(b.id).await.unwrap(), 1);
        assert_eq!(repo.count_downstream_blocked(c.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_similar_orders_by_cosine() {
        let repo = repo().await;
        let mut close = Task::new("close", "d");
        close.embedding = Some(vec![1.0, 0.0, 0.0]);
        repo.create(&close).await.unwrap();
        let mut far = Task::new("far", "d");
        far.embedding = Some(vec![0.0, 1.0, 0.0]);
        repo.create(&far).await.unwrap();
        let none = Task::new("none", "d");
        repo.create(&none).await.unwrap();

        let similar = repo.find_similar(&[0.9, 0.1, 0.0], 10).await.unwrap();
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].0.id, close.id);
        assert!(similar[0].1 > similar[1].1);
    }

    #[tokio::test]
    async fn test_list_siblings() {
        let repo = repo().await;
        let parent = Task::new("parent", "d");
        repo.create(&parent).await.unwrap();
        for i in 0..3 {
            let child = Task::new(format!("child-{i}"), "d").with_parent(parent.id);
            repo.create(&child).await.unwrap();
        }
        let siblings = repo.list_siblings(parent.id).await.unwrap();
        assert_eq!(siblings.len(), 3);
    }
}
