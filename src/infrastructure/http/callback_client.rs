//! Worker-side HTTP client for the orchestrator callback API (§6.1).
//!
//! Transient failures (network, 5xx, 429) retry with exponential backoff
//! and jitter under a total-time cap; 4xx responses surface immediately.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::StatusCode;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{HeartbeatAck, HeartbeatMessage, SandboxEvent};
use crate::domain::ports::{MessageBatch, OrchestratorApi, SyncSummary};

pub struct CallbackClient {
    base_url: String,
    client: reqwest::Client,
    max_elapsed: Duration,
}

impl CallbackClient {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            max_elapsed: Duration::from_secs(120),
        })
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Execute a request-producing closure with retries on transient
    /// failures.
    async fn with_retries<T, F, Fut>(&self, operation: F) -> DomainResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, backoff::Error<DomainError>>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(15))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        backoff::future::retry(policy, operation)
            .await
            .map_err(|err| {
                warn!(error = %err, "callback request exhausted retries");
                err
            })
    }

    fn classify(status: StatusCode, body: String) -> backoff::Error<DomainError> {
        let err = DomainError::Http(format!("{status}: {body}"));
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            backoff::Error::transient(err)
        } else {
            backoff::Error::permanent(err)
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> DomainResult<T> {
        let url = self.url(path);
        self.with_retries(|| {
            let url = url.clone();
            let body = body.clone();
            async move {
                let response = self
                    .client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(DomainError::from(e)))?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(Self::classify(status, text));
                }
                response
                    .json::<T>()
                    .await
                    .map_err(|e| backoff::Error::permanent(DomainError::from(e)))
            }
        })
        .await
    }
}

#[async_trait]
impl OrchestratorApi for CallbackClient {
    async fn post_event(&self, event: &SandboxEvent) -> DomainResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/sandbox/events",
                json!({
                    "id": event.id,
                    "sandbox_id": event.sandbox_id,
                    "event_type": event.event_type,
                    "event_data": event.event_data,
                    "source": event.source.as_str(),
                    "spec_id": event.spec_id,
                    "created_at": event.created_at,
                }),
            )
            .await?;
        Ok(())
    }

    async fn poll_messages(&self, sandbox_id: &str, cursor: u64) -> DomainResult<MessageBatch> {
        let url = self.url(&format!("/sandbox/{sandbox_id}/messages?cursor={cursor}"));
        self.with_retries(|| {
            let url = url.clone();
            async move {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(DomainError::from(e)))?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(Self::classify(status, text));
                }
                response
                    .json::<MessageBatch>()
                    .await
                    .map_err(|e| backoff::Error::permanent(DomainError::from(e)))
            }
        })
        .await
    }

    async fn post_heartbeat(&self, heartbeat: &HeartbeatMessage) -> DomainResult<HeartbeatAck> {
        self.post_json("/heartbeats", serde_json::to_value(heartbeat)?)
            .await
    }

    async fn post_sync_summary(&self, summary: &SyncSummary) -> DomainResult<()> {
        let _: serde_json::Value = self
            .post_json("/sandbox/sync-summary", serde_json::to_value(summary)?)
            .await?;
        Ok(())
    }

    async fn register_conversation(
        &self,
        task_id: Uuid,
        sandbox_id: &str,
        conversation_id: &str,
    ) -> DomainResult<()> {
        let _: serde_json::Value = self
            .post_json(
                "/conversations/register",
                json!({
                    "task_id": task_id,
                    "sandbox_id": sandbox_id,
                    "conversation_id": conversation_id,
                }),
            )
            .await?;
        Ok(())
    }
}
