//! Sandbox worker runtime tests: cap boundaries, message injection,
//! cooperative cancellation, and event idempotency.

mod common;

use std::sync::Arc;

use foreman::domain::models::event::event_types;
use foreman::domain::ports::{EventRepository, InjectedMessage, MessageKind};
use foreman::infrastructure::agent::{ScriptedAgentDriver, ScriptedTurn};
use foreman::worker::reporter::ArrayReporter;
use foreman::worker::{SandboxWorker, WorkerConfig};
use uuid::Uuid;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        sandbox_id: "sb-test".to_string(),
        task_id: Some(Uuid::new_v4()),
        poll_interval: 0.01,
        ..Default::default()
    }
}

#[tokio::test]
async fn max_turns_zero_exhausts_before_any_turn() {
    // Boundary: the worker emits agent.budget_exhausted without ever
    // opening a conversation.
    let api = common::InMemoryApi::new();
    let driver = Arc::new(ScriptedAgentDriver::new(vec![ScriptedTurn::text("never")]));
    let reporter = Arc::new(ArrayReporter::new());
    let config = WorkerConfig {
        max_turns: 0,
        ..worker_config()
    };

    let worker = SandboxWorker::new(config, driver.clone(), reporter.clone(), api);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome.final_event, event_types::AGENT_BUDGET_EXHAUSTED);
    assert_eq!(outcome.turns, 0);
    assert!(reporter.has_event(event_types::AGENT_BUDGET_EXHAUSTED).await);
    // The agent was never prompted.
    assert!(driver.prompts().await.is_empty());
}

#[tokio::test]
async fn single_turn_completes_and_reports_summary() {
    let api = common::InMemoryApi::new();
    let driver = Arc::new(ScriptedAgentDriver::new(vec![ScriptedTurn::text("done")]));
    let reporter = Arc::new(ArrayReporter::new());

    let worker = SandboxWorker::new(worker_config(), driver, reporter.clone(), api.clone());
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome.final_event, event_types::AGENT_COMPLETED);
    assert_eq!(outcome.turns, 1);
    assert!(outcome.session_id.is_some());

    // Conversation was registered with the orchestrator.
    assert_eq!(api.conversations.lock().await.len(), 1);

    // The terminal event carries the summary payload.
    let completed = reporter.events_of_type(event_types::AGENT_COMPLETED).await;
    assert_eq!(completed.len(), 1);
    assert!(completed[0].event_data.get("total_cost_usd").is_some());
    assert!(completed[0].event_data.get("task_id").is_some());
}

#[tokio::test]
async fn injected_messages_are_applied_in_order_between_turns() {
    let api = common::InMemoryApi::new();
    api.push_message(InjectedMessage {
        id: Uuid::new_v4(),
        offset: 1,
        kind: MessageKind::UserMessage,
        content: "first instruction".to_string(),
    })
    .await;
    api.push_message(InjectedMessage {
        id: Uuid::new_v4(),
        offset: 2,
        kind: MessageKind::UserMessage,
        content: "second instruction".to_string(),
    })
    .await;

    let driver = Arc::new(ScriptedAgentDriver::new(vec![
        ScriptedTurn::text("initial response"),
        ScriptedTurn::text("handled first"),
        ScriptedTurn::text("handled second"),
    ]));
    let reporter = Arc::new(ArrayReporter::new());

    let worker = SandboxWorker::new(worker_config(), driver.clone(), reporter, api);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome.turns, 3);
    let prompts = driver.prompts().await;
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[1], "first instruction");
    assert_eq!(prompts[2], "second instruction");
}

#[tokio::test]
async fn cancellation_is_cooperative() {
    // The agent sees a continuation asking it to stop, never a hard kill.
    let api = common::InMemoryApi::new();
    api.push_message(InjectedMessage {
        id: Uuid::new_v4(),
        offset: 1,
        kind: MessageKind::GuardianNudge { cancel: true },
        content: "stop".to_string(),
    })
    .await;

    let driver = Arc::new(ScriptedAgentDriver::new(vec![
        ScriptedTurn::text("working"),
        ScriptedTurn::text("stopping cleanly, summary follows"),
    ]));
    let reporter = Arc::new(ArrayReporter::new());

    let worker = SandboxWorker::new(worker_config(), driver.clone(), reporter.clone(), api);
    let outcome = worker.run().await.unwrap();

    assert!(outcome.canceled);
    assert_eq!(outcome.final_event, event_types::AGENT_COMPLETED);
    let prompts = driver.prompts().await;
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].to_lowercase().contains("cancellation"));
}

#[tokio::test]
async fn budget_cap_stops_continuous_iteration() {
    // S3 (worker side): turns costing 0.40 each against a 1.00 budget
    // stop the loop after the third turn.
    let dir = tempfile::tempdir().unwrap();
    let api = common::InMemoryApi::new();
    let driver = Arc::new(ScriptedAgentDriver::new(vec![
        ScriptedTurn::text("iterating").with_cost(0.40),
        ScriptedTurn::text("iterating").with_cost(0.40),
        ScriptedTurn::text("iterating").with_cost(0.40),
        ScriptedTurn::text("never reached").with_cost(0.40),
    ]));
    let reporter = Arc::new(ArrayReporter::new());
    let config = WorkerConfig {
        continuous_mode: true,
        max_budget_usd: 1.0,
        cwd: Some(dir.path().to_path_buf()),
        ..worker_config()
    };

    let worker = SandboxWorker::new(config, driver, reporter.clone(), api);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome.final_event, event_types::AGENT_BUDGET_EXHAUSTED);
    assert_eq!(outcome.turns, 3);
    assert!((outcome.usage.cost_usd - 1.2).abs() < 1e-9);
}

#[tokio::test]
async fn continuous_mode_stops_after_completion_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let api = common::InMemoryApi::new();
    let driver = Arc::new(ScriptedAgentDriver::new(vec![
        ScriptedTurn::text("still going"),
        ScriptedTurn::text("TASK_COMPLETE"),
        ScriptedTurn::text("TASK_COMPLETE"),
    ]));
    let reporter = Arc::new(ArrayReporter::new());
    let config = WorkerConfig {
        continuous_mode: true,
        completion_threshold: 2,
        cwd: Some(dir.path().to_path_buf()),
        ..worker_config()
    };

    let worker = SandboxWorker::new(config, driver, reporter, api);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome.final_event, event_types::AGENT_COMPLETED);
    assert_eq!(outcome.turns, 3);
}

#[tokio::test]
async fn replayed_events_do_not_duplicate_rows() {
    // Idempotency: replaying the same (sandbox_id, event_id) is a no-op.
    let repos = common::repos().await;
    let event = foreman::domain::models::SandboxEvent::new(
        "sb-1",
        event_types::AGENT_TEXT,
        serde_json::json!({"text": "hello"}),
        foreman::domain::models::EventSource::Agent,
    );

    assert!(repos.events.append(&event).await.unwrap());
    assert!(!repos.events.append(&event).await.unwrap());
    assert!(!repos.events.append(&event).await.unwrap());
    assert_eq!(repos.events.count_by_sandbox("sb-1").await.unwrap(), 1);
}
