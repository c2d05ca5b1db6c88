//! Worker-side heartbeat emitter.
//!
//! Runs as an interleaved cooperative task: every `interval` it builds a
//! checksummed heartbeat with the next monotone sequence number and posts
//! it to the orchestrator. Failed sends are logged and the sequence keeps
//! advancing, so the monitor observes the gap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{AgentStatus, HealthMetrics, HeartbeatMessage};
use crate::domain::ports::OrchestratorApi;

/// Live state the emitter samples on each beat.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    pub status: AgentStatus,
    pub current_task_id: Option<Uuid>,
    pub metrics: HealthMetrics,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Running,
            current_task_id: None,
            metrics: HealthMetrics::default(),
        }
    }
}

/// Spawnable heartbeat loop. Stops when `shutdown` flips to true.
pub async fn run_heartbeat_loop(
    api: Arc<dyn OrchestratorApi>,
    agent_id: Uuid,
    interval_secs: u64,
    state: watch::Receiver<HeartbeatState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sequence: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(agent_id = %agent_id, "heartbeat loop stopping");
                    return;
                }
            }
        }

        sequence += 1;
        let snapshot = state.borrow().clone();
        let message = HeartbeatMessage::new(
            agent_id,
            sequence,
            snapshot.status,
            snapshot.current_task_id,
            snapshot.metrics,
        );

        match api.post_heartbeat(&message).await {
            Ok(ack) => {
                if let Some(note) = ack.message {
                    debug!(agent_id = %agent_id, sequence, note, "heartbeat ack");
                }
            }
            Err(err) => {
                // Keep the sequence advancing so the monitor sees the gap.
                warn!(agent_id = %agent_id, sequence, error = %err, "heartbeat send failed");
            }
        }
    }
}
