//! Cost accountant tests: reservation semantics, settlement, pressure
//! events, and the budget-exhaustion scenario.

mod common;

use std::sync::Arc;

use foreman::domain::errors::DomainError;
use foreman::domain::models::config::GuardianConfig;
use foreman::domain::models::{
    ActionStatus, AgentStatus, BudgetScope, CostRecord, GuardianActionType, Task, TaskStatus,
};
use foreman::domain::ports::{
    AgentRepository, CostRepository, GuardianRepository, TaskRepository,
};
use foreman::infrastructure::database::AllocationRepositoryImpl;
use foreman::services::{CostAccountant, EventBus, EventFilter, Guardian};
use uuid::Uuid;

#[tokio::test]
async fn third_call_is_rejected_when_reservation_would_underflow() {
    // S3: limit 1.00, calls cost 0.40, 0.40, 0.30. The third reservation
    // (estimated 0.40) would underflow and is rejected.
    let repos = common::repos().await;
    let bus = Arc::new(EventBus::default());
    let accountant = CostAccountant::new(repos.costs.clone(), bus);

    let task_id = Uuid::new_v4();
    let scopes = vec![(BudgetScope::Task, task_id.to_string())];
    accountant
        .ensure_budget(BudgetScope::Task, &task_id.to_string(), 1.00)
        .await
        .unwrap();

    for cost in [0.40, 0.40] {
        let reservation = accountant.reserve(&scopes, 0.40).await.unwrap();
        accountant
            .settle(
                reservation,
                CostRecord::new(task_id, "anthropic", "sonnet", 1000, 500, cost / 2.0, cost / 2.0),
            )
            .await
            .unwrap();
    }

    let err = accountant.reserve(&scopes, 0.40).await.unwrap_err();
    assert!(matches!(err, DomainError::BudgetExhausted { .. }));

    // Ledger and budget agree: spent = Σ total_cost.
    let budget = repos
        .costs
        .get_budget(BudgetScope::Task, &task_id.to_string())
        .await
        .unwrap()
        .unwrap();
    let records = repos.costs.list_records_for_task(task_id).await.unwrap();
    let ledger_total: f64 = records.iter().map(|r| r.total_cost).sum();
    assert!((budget.spent_usd - ledger_total).abs() < 1e-9);
    assert!(budget.spent_usd + budget.reserved_usd <= budget.limit_usd + 1e-9);
}

#[tokio::test]
async fn settlement_refunds_reservation_difference() {
    let repos = common::repos().await;
    let accountant = CostAccountant::new(repos.costs.clone(), Arc::new(EventBus::default()));

    let task_id = Uuid::new_v4();
    let scopes = vec![(BudgetScope::Task, task_id.to_string())];
    accountant
        .ensure_budget(BudgetScope::Task, &task_id.to_string(), 1.00)
        .await
        .unwrap();

    // Reserve the upper estimate, settle the smaller actual.
    let reservation = accountant.reserve(&scopes, 0.50).await.unwrap();
    assert!((accountant.remaining(&scopes).await.unwrap().unwrap() - 0.50).abs() < 1e-9);
    accountant
        .settle(
            reservation,
            CostRecord::new(task_id, "anthropic", "sonnet", 100, 50, 0.05, 0.05),
        )
        .await
        .unwrap();

    // 0.10 spent, 0.40 refunded.
    assert!((accountant.remaining(&scopes).await.unwrap().unwrap() - 0.90).abs() < 1e-9);
}

#[tokio::test]
async fn release_restores_full_headroom() {
    let repos = common::repos().await;
    let accountant = CostAccountant::new(repos.costs.clone(), Arc::new(EventBus::default()));

    let scopes = vec![(BudgetScope::Agent, "a1".to_string())];
    accountant
        .ensure_budget(BudgetScope::Agent, "a1", 2.0)
        .await
        .unwrap();

    let reservation = accountant.reserve(&scopes, 1.5).await.unwrap();
    accountant.release(reservation).await.unwrap();
    assert!((accountant.remaining(&scopes).await.unwrap().unwrap() - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn crossing_alert_threshold_emits_cost_pressure() {
    let repos = common::repos().await;
    let bus = Arc::new(EventBus::default());
    let mut stream = bus.subscribe(EventFilter::for_type_prefix("budget.")).await;
    let accountant = CostAccountant::new(repos.costs.clone(), bus);

    let task_id = Uuid::new_v4();
    let scopes = vec![(BudgetScope::Task, task_id.to_string())];
    accountant
        .ensure_budget(BudgetScope::Task, &task_id.to_string(), 1.00)
        .await
        .unwrap();

    // 0.85 spent crosses the default 0.8 alert threshold.
    let reservation = accountant.reserve(&scopes, 0.85).await.unwrap();
    accountant
        .settle(
            reservation,
            CostRecord::new(task_id, "anthropic", "sonnet", 1000, 500, 0.45, 0.40),
        )
        .await
        .unwrap();

    let event = stream.recv().await.unwrap();
    assert_eq!(event.event_type, "budget.cost_pressure");
}

#[tokio::test]
async fn limit_exceeded_pauses_running_agents_of_scope() {
    // Crossing the hard limit triggers pause_agent on the running agents
    // of the scope, through the same budget watch the orchestrator runs.
    let repos = common::repos().await;
    let bus = Arc::new(EventBus::default());
    let accountant = CostAccountant::new(repos.costs.clone(), bus.clone());
    let guardian = Arc::new(Guardian::new(
        repos.guardian.clone(),
        repos.agents.clone(),
        repos.tasks.clone(),
        repos.tickets.clone(),
        Arc::new(AllocationRepositoryImpl::new(repos.db.pool().clone())),
        bus.clone(),
        GuardianConfig::default(),
    ));

    // A running agent bound to the task whose budget will be exhausted.
    let mut agent = common::idle_agent(&repos, &[]).await;
    let mut task = Task::new("costly", "d");
    repos.tasks.create(&task).await.unwrap();
    task.transition_to(TaskStatus::Assigned).unwrap();
    repos
        .tasks
        .update_with_version_check(&task, task.version - 1)
        .await
        .unwrap();
    task.assigned_agent = Some(agent.id);
    task.transition_to(TaskStatus::Running).unwrap();
    repos
        .tasks
        .update_with_version_check(&task, task.version - 1)
        .await
        .unwrap();
    agent.assign_task(task.id).unwrap();
    repos
        .agents
        .update_with_version_check(&agent, agent.version - 1)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let stream = bus
        .subscribe(EventFilter::for_type_prefix("budget.limit_exceeded"))
        .await;
    let watch_task = tokio::spawn({
        let guardian = guardian.clone();
        async move { guardian.run_budget_watch(stream, shutdown_rx).await }
    });

    let scopes = vec![(BudgetScope::Task, task.id.to_string())];
    accountant
        .ensure_budget(BudgetScope::Task, &task.id.to_string(), 1.0)
        .await
        .unwrap();
    let reservation = accountant.reserve(&scopes, 1.0).await.unwrap();
    accountant
        .settle(
            reservation,
            CostRecord::new(task.id, "anthropic", "sonnet", 9000, 4000, 0.5, 0.5),
        )
        .await
        .unwrap();

    // The limit event must pause the scope's running agent.
    let mut paused = false;
    for _ in 0..100 {
        let current = repos.agents.get(agent.id).await.unwrap().unwrap();
        if current.status == AgentStatus::Quarantined {
            paused = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(paused, "running agent of the exhausted scope must be paused");

    let actions = repos.guardian.list_for_agent(agent.id).await.unwrap();
    assert!(actions.iter().any(|a| {
        a.action == GuardianActionType::PauseAgent
            && a.status == ActionStatus::Executed
            && a.target_task == Some(task.id)
    }));

    let _ = shutdown_tx.send(true);
    watch_task.abort();
}

#[tokio::test]
async fn multi_scope_reservation_rolls_back_on_rejection() {
    let repos = common::repos().await;
    let accountant = CostAccountant::new(repos.costs.clone(), Arc::new(EventBus::default()));

    let task_scopes = vec![
        (BudgetScope::Task, "t1".to_string()),
        (BudgetScope::Project, "p1".to_string()),
    ];
    accountant
        .ensure_budget(BudgetScope::Task, "t1", 10.0)
        .await
        .unwrap();
    // Project scope is the tight one.
    accountant
        .ensure_budget(BudgetScope::Project, "p1", 0.10)
        .await
        .unwrap();

    let err = accountant.reserve(&task_scopes, 0.50).await.unwrap_err();
    assert!(matches!(err, DomainError::BudgetExhausted { .. }));

    // The task-scope reservation was rolled back.
    let task_budget = repos
        .costs
        .get_budget(BudgetScope::Task, "t1")
        .await
        .unwrap()
        .unwrap();
    assert!(task_budget.reserved_usd.abs() < 1e-9);
}

#[tokio::test]
async fn unconstrained_scope_is_unlimited() {
    let repos = common::repos().await;
    let accountant = CostAccountant::new(repos.costs.clone(), Arc::new(EventBus::default()));

    let scopes = vec![(BudgetScope::Task, "no-budget".to_string())];
    assert!(accountant.remaining(&scopes).await.unwrap().is_none());
    let reservation = accountant.reserve(&scopes, 1000.0).await.unwrap();
    assert!(reservation.scopes.is_empty());
}
