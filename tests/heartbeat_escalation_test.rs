//! Heartbeat protocol and escalation ladder tests (monitor + guardian).

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use foreman::domain::models::config::{GuardianConfig, HeartbeatConfig};
use foreman::domain::models::{
    ActionStatus, AgentStatus, HealthMetrics, HeartbeatMessage,
};
use foreman::domain::ports::{AgentRepository, GuardianRepository};
use foreman::services::{
    Escalation, EventBus, EventFilter, Guardian, HeartbeatMonitor, Incident, IncidentKind,
};
use foreman::infrastructure::database::AllocationRepositoryImpl;

fn guardian_for(repos: &common::Repos, bus: Arc<EventBus>, config: GuardianConfig) -> Arc<Guardian> {
    Arc::new(Guardian::new(
        repos.guardian.clone(),
        repos.agents.clone(),
        repos.tasks.clone(),
        repos.tickets.clone(),
        Arc::new(AllocationRepositoryImpl::new(repos.db.pool().clone())),
        bus,
        config,
    ))
}

fn config() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_secs: 1,
        warn_after: 1,
        degrade_after: 2,
        guardian_after: 4,
        fail_after: 6,
        recovery_grace_secs: 10,
        anomaly_threshold: 0.7,
        anomaly_consecutive: 3,
    }
}

#[tokio::test]
async fn accepted_sequences_are_strictly_increasing() {
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let monitor = HeartbeatMonitor::new(
        repos.agents.clone(),
        Arc::new(EventBus::default()),
        config(),
    );

    for sequence in [1, 2, 3] {
        let hb = HeartbeatMessage::new(
            agent.id,
            sequence,
            AgentStatus::Idle,
            None,
            HealthMetrics::default(),
        );
        let ack = monitor.handle_heartbeat(hb).await.unwrap();
        assert!(ack.received);
    }

    // A replay of sequence 2 is acked but not applied.
    let replay = HeartbeatMessage::new(
        agent.id,
        2,
        AgentStatus::Idle,
        None,
        HealthMetrics::default(),
    );
    let ack = monitor.handle_heartbeat(replay).await.unwrap();
    assert!(ack.received);
    assert!(ack.message.unwrap().contains("replay"));

    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.sequence_number, 3);
    assert_eq!(stored.last_expected_sequence, 4);
}

#[tokio::test]
async fn corrupt_heartbeat_is_counted_and_dropped() {
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let monitor = HeartbeatMonitor::new(
        repos.agents.clone(),
        Arc::new(EventBus::default()),
        config(),
    );

    let mut hb = HeartbeatMessage::new(
        agent.id,
        1,
        AgentStatus::Idle,
        None,
        HealthMetrics::default(),
    );
    hb.checksum = "0".repeat(64);
    assert!(monitor.handle_heartbeat(hb).await.is_err());

    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.corrupt_heartbeats, 1);
    // Not applied: sequence untouched.
    assert_eq!(stored.sequence_number, 0);
}

#[tokio::test]
async fn sequence_gap_increments_missed_counter() {
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let monitor = HeartbeatMonitor::new(
        repos.agents.clone(),
        Arc::new(EventBus::default()),
        config(),
    );

    let hb = HeartbeatMessage::new(
        agent.id,
        1,
        AgentStatus::Idle,
        None,
        HealthMetrics::default(),
    );
    monitor.handle_heartbeat(hb).await.unwrap();

    // Jump to 4: sequences 2 and 3 went missing.
    let hb = HeartbeatMessage::new(
        agent.id,
        4,
        AgentStatus::Idle,
        None,
        HealthMetrics::default(),
    );
    let ack = monitor.handle_heartbeat(hb).await.unwrap();
    assert!(ack.message.unwrap().contains("gap of 2"));

    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_missed_heartbeats, 2);
    // Gap of 2 reaches the degrade rung.
    assert_eq!(stored.status, AgentStatus::Degraded);
}

#[tokio::test]
async fn silence_escalates_along_the_ladder() {
    // S2: heartbeats 1..3 then silence. With a 1 s interval, after 2 s the
    // agent is DEGRADED, after 4 s a GuardianAction exists, after 6 s the
    // agent is FAILED. Monitor and guardian share one bus, wired exactly
    // as the orchestrator wires them; the clock is injected.
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let bus = Arc::new(EventBus::default());
    let monitor = HeartbeatMonitor::new(repos.agents.clone(), bus.clone(), config());
    let guardian = guardian_for(&repos, bus.clone(), GuardianConfig::default());

    // The same watch the orchestrator spawns: escalation events on the
    // shared bus become recorded interventions.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let stream = bus.subscribe(EventFilter::for_type_prefix("agent.")).await;
    let watch_task = tokio::spawn({
        let guardian = guardian.clone();
        async move { guardian.run_agent_watch(stream, shutdown_rx).await }
    });

    let last_beat = Utc::now();
    for sequence in [1, 2, 3] {
        let hb = HeartbeatMessage::new(
            agent.id,
            sequence,
            AgentStatus::Idle,
            None,
            HealthMetrics::default(),
        );
        monitor.handle_heartbeat(hb).await.unwrap();
    }
    // Anchor the last heartbeat timestamp for deterministic math.
    let mut stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    stored.last_heartbeat_at = Some(last_beat);
    stored.version += 1;
    repos
        .agents
        .update_with_version_check(&stored, stored.version - 1)
        .await
        .unwrap();

    // After ~2 s of silence: DEGRADED, no intervention yet.
    let outcomes = monitor
        .check_overdue(last_beat + Duration::milliseconds(2500))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, Escalation::Degrade);
    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::Degraded);
    assert!(repos
        .guardian
        .list_for_agent(agent.id)
        .await
        .unwrap()
        .is_empty());

    // After ~4 s: guardian rung. The published escalation event must
    // produce a GuardianAction without any manual incident.
    let outcomes = monitor
        .check_overdue(last_beat + Duration::milliseconds(4500))
        .await
        .unwrap();
    assert_eq!(outcomes[0].1, Escalation::Guardian);
    let mut actions = Vec::new();
    for _ in 0..100 {
        actions = repos.guardian.list_for_agent(agent.id).await.unwrap();
        if !actions.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(
        !actions.is_empty(),
        "guardian rung must record an action through the bus"
    );
    assert!(actions
        .iter()
        .any(|a| a.target_agent == Some(agent.id) && a.reason.contains("missed heartbeats")));

    // After ~6 s: FAILED.
    let outcomes = monitor
        .check_overdue(last_beat + Duration::milliseconds(6500))
        .await
        .unwrap();
    assert_eq!(outcomes[0].1, Escalation::Fail);
    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::Failed);

    let _ = shutdown_tx.send(true);
    watch_task.abort();
}

#[tokio::test]
async fn failed_agent_quarantines_after_grace_window() {
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let monitor = HeartbeatMonitor::new(
        repos.agents.clone(),
        Arc::new(EventBus::default()),
        config(),
    );

    let mut stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    stored.transition_to(AgentStatus::Failed).unwrap();
    repos
        .agents
        .update_with_version_check(&stored, stored.version - 1)
        .await
        .unwrap();

    // Inside the grace window: still FAILED.
    monitor
        .check_overdue(Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    let inside = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(inside.status, AgentStatus::Failed);

    // Past the grace window: QUARANTINED (recoverable).
    monitor
        .check_overdue(Utc::now() + Duration::seconds(60))
        .await
        .unwrap();
    let after = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(after.status, AgentStatus::Quarantined);
}

#[tokio::test]
async fn guardian_auto_executes_low_authority_and_gates_high() {
    let repos = common::repos().await;
    let agent = common::idle_agent(&repos, &[]).await;
    let guardian = guardian_for(
        &repos,
        Arc::new(EventBus::default()),
        GuardianConfig {
            auto_authority: 2,
            approval_timeout_secs: 900,
        },
    );

    // pause_agent (authority 2) auto-executes: the agent quarantines.
    let action = guardian
        .handle_incident(Incident {
            agent_id: Some(agent.id),
            task_id: None,
            kind: IncidentKind::CostOverrun,
            severity: 2,
            reason: "budget limit crossed".into(),
        })
        .await
        .unwrap();
    assert_eq!(action.status, ActionStatus::Executed);
    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::Quarantined);

    // terminate_agent (authority 5) waits for an approver.
    let action = guardian
        .handle_incident(Incident {
            agent_id: Some(agent.id),
            task_id: None,
            kind: IncidentKind::Anomaly,
            severity: 5,
            reason: "sustained anomaly".into(),
        })
        .await
        .unwrap();
    assert_eq!(action.status, ActionStatus::PendingReview);
    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_ne!(stored.status, AgentStatus::Terminated);

    // Approval executes it.
    let approved = guardian.approve(action.id, "operator").await.unwrap();
    assert_eq!(approved.status, ActionStatus::Executed);
    let stored = repos.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::Terminated);
}
