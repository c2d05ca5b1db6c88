//! `foreman orchestrator start` — wires the kernel together and runs the
//! cooperative loops until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use crate::domain::models::Config;
use crate::infrastructure::database::{
    AgentRepositoryImpl, AllocationRepositoryImpl, BusEventSink, CostRepositoryImpl,
    DatabaseConnection, EventRepositoryImpl, GuardianRepositoryImpl, MergeRepositoryImpl,
    TaskRepositoryImpl, TicketRepositoryImpl,
};
use crate::infrastructure::sandbox::HttpSandboxProvider;
use crate::services::{
    merge_coordinator::GitMergeBackend, ConflictResolver, EventBus, EventBusConfig, Guardian,
    HeartbeatMonitor, MergeCoordinator, OrchestratorWorker, Resolution, ResolverLimits,
    TaskScheduler,
};

/// No-op conflict resolver used until an agent-backed one is configured;
/// conflicts fail the merge for manual resolution.
struct ManualResolver;

#[async_trait::async_trait]
impl ConflictResolver for ManualResolver {
    async fn resolve(
        &self,
        _workdir: &std::path::Path,
        _files: &[String],
    ) -> crate::domain::errors::DomainResult<Resolution> {
        Ok(Resolution {
            resolved: false,
            tokens: 0,
            cost_usd: 0.0,
        })
    }
}

pub async fn handle_start(config: Config, max_agents_override: Option<usize>) -> Result<()> {
    let mut config = config;
    if let Some(max_agents) = max_agents_override {
        config.orchestrator.max_agents = max_agents;
    }

    let database_url = format!("sqlite:{}", config.database.path);
    let db = DatabaseConnection::new(&database_url)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;
    let pool = db.pool().clone();

    // Repositories.
    let task_repo = Arc::new(TaskRepositoryImpl::new(pool.clone()));
    let ticket_repo = Arc::new(TicketRepositoryImpl::new(pool.clone()));
    let agent_repo = Arc::new(AgentRepositoryImpl::new(pool.clone()));
    let event_repo = Arc::new(EventRepositoryImpl::new(pool.clone()));
    let cost_repo = Arc::new(CostRepositoryImpl::new(pool.clone()));
    let guardian_repo = Arc::new(GuardianRepositoryImpl::new(pool.clone()));
    let merge_repo = Arc::new(MergeRepositoryImpl::new(pool.clone()));
    let allocation_repo = Arc::new(AllocationRepositoryImpl::new(pool.clone()));

    // Event bus with a durable sink: persisted before fan-out.
    let bus = Arc::new(
        EventBus::new(EventBusConfig::default())
            .with_sink(Arc::new(BusEventSink::new(pool.clone()))),
    );

    // Services.
    let scheduler = Arc::new(TaskScheduler::new(
        task_repo.clone(),
        ticket_repo.clone(),
        agent_repo.clone(),
        cost_repo.clone(),
        bus.clone(),
        &config.scheduler,
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        agent_repo.clone(),
        bus.clone(),
        config.heartbeat.clone(),
    ));
    let guardian = Arc::new(Guardian::new(
        guardian_repo,
        agent_repo.clone(),
        task_repo.clone(),
        ticket_repo.clone(),
        allocation_repo,
        bus.clone(),
        config.guardian.clone(),
    ));
    let merge_coordinator = Arc::new(MergeCoordinator::new(
        merge_repo,
        Arc::new(GitMergeBackend),
        Arc::new(ManualResolver),
        bus.clone(),
        ResolverLimits::default(),
        PathBuf::from("."),
    ));

    let provider = Arc::new(
        HttpSandboxProvider::new(
            config.sandbox.base_url.clone(),
            config.sandbox.api_key.clone(),
        )
        .context("failed to build sandbox provider")?,
    );
    let callback_url = std::env::var("FOREMAN_CALLBACK_URL")
        .unwrap_or_else(|_| "http://localhost:8000".to_string());
    let worker = Arc::new(OrchestratorWorker::new(
        scheduler.clone(),
        task_repo,
        agent_repo,
        event_repo,
        provider,
        bus.clone(),
        config.orchestrator.clone(),
        config.retry.clone(),
        config.sandbox.clone(),
        callback_url,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Convergence: when a sibling group finishes, merge its branches in
    // ascending conflict order. Worker branches follow the task/<id>
    // convention set at dispatch.
    let merge_watch = {
        let coordinator = merge_coordinator.clone();
        let mut stream = bus
            .subscribe(crate::services::EventFilter::for_type_prefix(
                "task.merge_required",
            ))
            .await;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = stream.recv() => {
                        let Some(event) = event else { return };
                        let Ok(parent_id) = event.entity_id.parse::<uuid::Uuid>() else {
                            continue;
                        };
                        let ticket_id = event
                            .payload
                            .get("ticket_id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| s.parse::<uuid::Uuid>().ok());
                        let incoming: Vec<crate::services::IncomingBranch> = event
                            .payload
                            .get("source_task_ids")
                            .and_then(|v| v.as_array())
                            .map(|ids| {
                                ids.iter()
                                    .filter_map(|v| v.as_str())
                                    .filter_map(|s| s.parse::<uuid::Uuid>().ok())
                                    .map(|task_id| crate::services::IncomingBranch {
                                        task_id,
                                        branch: format!("task/{task_id}"),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        if incoming.is_empty() {
                            continue;
                        }
                        if let Err(err) = coordinator
                            .run_convergence(parent_id, ticket_id, incoming, "main")
                            .await
                        {
                            error!(parent_id = %parent_id, error = %err, "convergence merge failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    };

    // Escalation: the monitor's guardian-rung and sustained-anomaly
    // events become recorded interventions.
    let guardian_watch = {
        let guardian = guardian.clone();
        let stream = bus
            .subscribe(crate::services::EventFilter::for_type_prefix("agent."))
            .await;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { guardian.run_agent_watch(stream, shutdown).await })
    };

    // Cost intervention: crossing a budget's hard limit pauses the
    // running agents of that scope through the guardian.
    let cost_watch = {
        let guardian = guardian.clone();
        let stream = bus
            .subscribe(crate::services::EventFilter::for_type_prefix(
                "budget.limit_exceeded",
            ))
            .await;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { guardian.run_budget_watch(stream, shutdown).await })
    };

    // Periodic sweeps: admission, overdue heartbeats, timeouts, guardian
    // approval expiry.
    let sweep = {
        let scheduler = scheduler.clone();
        let monitor = monitor.clone();
        let guardian = guardian.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = Duration::from_secs(config.heartbeat.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                if let Err(err) = scheduler.admit_pending().await {
                    error!(error = %err, "admission sweep failed");
                }
                if let Err(err) = scheduler.enforce_timeouts(chrono::Utc::now()).await {
                    error!(error = %err, "timeout sweep failed");
                }
                if let Err(err) = monitor.check_overdue(chrono::Utc::now()).await {
                    error!(error = %err, "heartbeat sweep failed");
                }
                if let Err(err) = guardian.expire_pending().await {
                    error!(error = %err, "guardian approval sweep failed");
                }
            }
        })
    };

    info!(max_agents = config.orchestrator.max_agents, "orchestrator starting");

    tokio::select! {
        result = worker.run(shutdown_rx) => {
            result.context("orchestrator loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    sweep.abort();
    merge_watch.abort();
    guardian_watch.abort();
    cost_watch.abort();
    db.close().await;
    Ok(())
}
