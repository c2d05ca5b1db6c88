//! Event reporter implementations: array (tests), jsonl (local), http
//! (production).
//!
//! The HTTP reporter retries transient failures with exponential backoff
//! and jitter and guarantees at-least-once delivery — events carry ids so
//! the store deduplicates replays.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::SandboxEvent;
use crate::domain::ports::{EventReporter, OrchestratorApi};

/// Collects events in memory. Test reporter.
#[derive(Default)]
pub struct ArrayReporter {
    events: Mutex<Vec<SandboxEvent>>,
}

impl ArrayReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SandboxEvent> {
        self.events.lock().await.clone()
    }

    pub async fn has_event(&self, event_type: &str) -> bool {
        self.events
            .lock()
            .await
            .iter()
            .any(|e| e.event_type == event_type)
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
impl EventReporter for ArrayReporter {
    async fn report(&self, event: SandboxEvent) -> DomainResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn flush(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// Appends one JSON line per event to `<output>/events.jsonl`.
pub struct JsonlReporter {
    path: PathBuf,
    buffer: Mutex<Vec<String>>,
}

impl JsonlReporter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventReporter for JsonlReporter {
    async fn report(&self, event: SandboxEvent) -> DomainResult<()> {
        let line = serde_json::to_string(&event)?;
        self.buffer.lock().await.push(line);
        self.flush().await
    }

    async fn flush(&self) -> DomainResult<()> {
        let lines: Vec<String> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if lines.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Delivers events to the orchestrator over HTTP with bounded retries.
pub struct HttpReporter {
    api: Arc<dyn OrchestratorApi>,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl HttpReporter {
    pub fn new(api: Arc<dyn OrchestratorApi>) -> Self {
        Self {
            api,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 15_000,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl EventReporter for HttpReporter {
    async fn report(&self, event: SandboxEvent) -> DomainResult<()> {
        use rand::Rng;
        let mut delay_ms = self.initial_backoff_ms;
        let mut last_err: Option<DomainError> = None;

        for attempt in 0..=self.max_retries {
            match self.api.post_event(&event).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
                    warn!(
                        attempt,
                        event_type = %event.event_type,
                        error = %err,
                        "event delivery retry"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.max_backoff_ms);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| DomainError::Http("event delivery failed".to_string())))
    }

    async fn flush(&self) -> DomainResult<()> {
        Ok(())
    }
}
