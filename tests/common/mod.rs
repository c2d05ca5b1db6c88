//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use foreman::domain::errors::DomainResult;
use foreman::domain::models::{
    Agent, AgentStatus, HeartbeatAck, HeartbeatMessage, SandboxEvent,
};
use foreman::domain::ports::{
    AgentRepository, InjectedMessage, MessageBatch, OrchestratorApi, SyncSummary,
};
use foreman::infrastructure::database::{
    AgentRepositoryImpl, CostRepositoryImpl, DatabaseConnection, EventRepositoryImpl,
    GuardianRepositoryImpl, MergeRepositoryImpl, SpecRepositoryImpl, TaskRepositoryImpl,
    TicketRepositoryImpl,
};

/// Fresh migrated in-memory database.
pub async fn memory_db() -> DatabaseConnection {
    let db = DatabaseConnection::new("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    db.migrate().await.expect("failed to run migrations");
    db
}

/// All repositories over one database.
pub struct Repos {
    pub db: DatabaseConnection,
    pub tasks: Arc<TaskRepositoryImpl>,
    pub tickets: Arc<TicketRepositoryImpl>,
    pub agents: Arc<AgentRepositoryImpl>,
    pub events: Arc<EventRepositoryImpl>,
    pub costs: Arc<CostRepositoryImpl>,
    pub guardian: Arc<GuardianRepositoryImpl>,
    pub merges: Arc<MergeRepositoryImpl>,
    pub specs: Arc<SpecRepositoryImpl>,
}

pub async fn repos() -> Repos {
    let db = memory_db().await;
    let pool = db.pool().clone();
    Repos {
        tasks: Arc::new(TaskRepositoryImpl::new(pool.clone())),
        tickets: Arc::new(TicketRepositoryImpl::new(pool.clone())),
        agents: Arc::new(AgentRepositoryImpl::new(pool.clone())),
        events: Arc::new(EventRepositoryImpl::new(pool.clone())),
        costs: Arc::new(CostRepositoryImpl::new(pool.clone())),
        guardian: Arc::new(GuardianRepositoryImpl::new(pool.clone())),
        merges: Arc::new(MergeRepositoryImpl::new(pool.clone())),
        specs: Arc::new(SpecRepositoryImpl::new(pool.clone())),
        db,
    }
}

/// Register an IDLE agent with the given capabilities.
pub async fn idle_agent(repos: &Repos, capabilities: &[&str]) -> Agent {
    let mut agent = Agent::new("test-agent", "coder")
        .with_capabilities(capabilities.iter().map(|s| (*s).to_string()).collect());
    repos.agents.create(&agent).await.unwrap();
    agent.transition_to(AgentStatus::Idle).unwrap();
    repos
        .agents
        .update_with_version_check(&agent, agent.version - 1)
        .await
        .unwrap();
    agent
}

/// In-memory orchestrator endpoint for worker tests: queues injected
/// messages and records everything posted back.
#[derive(Default)]
pub struct InMemoryApi {
    pub messages: Mutex<Vec<InjectedMessage>>,
    pub events: Mutex<Vec<SandboxEvent>>,
    pub heartbeats: Mutex<Vec<HeartbeatMessage>>,
    pub summaries: Mutex<Vec<SyncSummary>>,
    pub conversations: Mutex<Vec<(Uuid, String, String)>>,
}

impl InMemoryApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push_message(&self, message: InjectedMessage) {
        self.messages.lock().await.push(message);
    }

    pub async fn events_of_type(&self, event_type: &str) -> Vec<SandboxEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrchestratorApi for InMemoryApi {
    async fn post_event(&self, event: &SandboxEvent) -> DomainResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn poll_messages(&self, _sandbox_id: &str, cursor: u64) -> DomainResult<MessageBatch> {
        let queue = self.messages.lock().await;
        let messages: Vec<_> = queue.iter().filter(|m| m.offset > cursor).cloned().collect();
        let next_cursor = messages.iter().map(|m| m.offset).max().unwrap_or(cursor);
        Ok(MessageBatch {
            messages,
            next_cursor,
        })
    }

    async fn post_heartbeat(&self, heartbeat: &HeartbeatMessage) -> DomainResult<HeartbeatAck> {
        self.heartbeats.lock().await.push(heartbeat.clone());
        Ok(HeartbeatAck::received(
            heartbeat.agent_id,
            heartbeat.sequence_number,
        ))
    }

    async fn post_sync_summary(&self, summary: &SyncSummary) -> DomainResult<()> {
        self.summaries.lock().await.push(summary.clone());
        Ok(())
    }

    async fn register_conversation(
        &self,
        task_id: Uuid,
        sandbox_id: &str,
        conversation_id: &str,
    ) -> DomainResult<()> {
        self.conversations.lock().await.push((
            task_id,
            sandbox_id.to_string(),
            conversation_id.to_string(),
        ));
        Ok(())
    }
}
