//! HTTP-backed coding-agent driver.
//!
//! Drives a messages-style LLM API one turn at a time: the session keeps
//! the conversation history, sends it with each user message, and queues
//! the returned content blocks for the worker to pump. Outbound calls are
//! rate limited and transient failures retried with exponential backoff.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use base64::Engine;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{
    AgentBlock, AgentDriver, AgentSession, SessionOptions, TurnUsage,
};

/// Per-million-token pricing used to convert usage into cost.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub prompt_per_mtok: f64,
    pub completion_per_mtok: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            prompt_per_mtok: 3.0,
            completion_per_mtok: 15.0,
        }
    }
}

pub struct HttpAgentDriver {
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
    limiter: Arc<DefaultDirectRateLimiter>,
    pricing: ModelPricing,
}

impl HttpAgentDriver {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        // Conservative default: one call per second, small bursts allowed.
        let quota = Quota::per_second(NonZeroU32::new(1).unwrap())
            .allow_burst(NonZeroU32::new(5).unwrap());
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            client,
            limiter: Arc::new(RateLimiter::direct(quota)),
            pricing: ModelPricing::default(),
        })
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<Value>,
    usage: ApiUsage,
}

#[async_trait]
impl AgentDriver for HttpAgentDriver {
    async fn open_session(&self, options: SessionOptions) -> DomainResult<Box<dyn AgentSession>> {
        let mut history: Vec<Value> = Vec::new();
        if let Some(transcript) = &options.session_transcript_b64 {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(transcript)
                .map_err(|e| DomainError::ValidationFailed(format!("session transcript: {e}")))?;
            history = serde_json::from_slice(&bytes)?;
        }

        Ok(Box::new(HttpAgentSession {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            system_prompt: options.system_prompt.clone(),
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            pricing: self.pricing,
            history,
            pending: std::collections::VecDeque::new(),
            last_usage: TurnUsage::default(),
            session_id: options
                .resume_session_id
                .unwrap_or_else(|| format!("conv-{}", Uuid::new_v4())),
        }))
    }
}

struct HttpAgentSession {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
    limiter: Arc<DefaultDirectRateLimiter>,
    pricing: ModelPricing,
    history: Vec<Value>,
    pending: std::collections::VecDeque<AgentBlock>,
    last_usage: TurnUsage,
    session_id: String,
}

impl HttpAgentSession {
    fn block_from_content(content: &Value) -> Option<AgentBlock> {
        match content.get("type").and_then(|t| t.as_str())? {
            "text" => Some(AgentBlock::Text {
                text: content.get("text")?.as_str()?.to_string(),
            }),
            "thinking" => Some(AgentBlock::Thinking {
                text: content.get("thinking")?.as_str()?.to_string(),
            }),
            "tool_use" => Some(AgentBlock::ToolUse {
                tool_use_id: content.get("id")?.as_str()?.to_string(),
                name: content.get("name")?.as_str()?.to_string(),
                input: content.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        }
    }

    async fn call_api(&self, body: &Value) -> DomainResult<ApiResponse> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(Duration::from_secs(300)))
            .build();

        backoff::future::retry(policy, || async {
            self.limiter.until_ready().await;

            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(body)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(DomainError::from(e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                return Err(backoff::Error::transient(DomainError::Driver(format!(
                    "{status}: {text}"
                ))));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(DomainError::Driver(format!(
                    "{status}: {text}"
                ))));
            }
            response
                .json::<ApiResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(DomainError::from(e)))
        })
        .await
    }
}

#[async_trait]
impl AgentSession for HttpAgentSession {
    async fn send_user(&mut self, text: &str) -> DomainResult<()> {
        self.history.push(json!({"role": "user", "content": text}));

        let mut body = json!({
            "model": self.model,
            "max_tokens": 8192,
            "messages": self.history,
        });
        if let Some(system) = &self.system_prompt {
            body["system"] = json!(system);
        }

        let response = self.call_api(&body).await?;

        self.pending = response
            .content
            .iter()
            .filter_map(Self::block_from_content)
            .collect();
        self.history.push(json!({
            "role": "assistant",
            "content": response.content,
        }));

        self.last_usage = TurnUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            cost_usd: response.usage.input_tokens as f64 / 1_000_000.0
                * self.pricing.prompt_per_mtok
                + response.usage.output_tokens as f64 / 1_000_000.0
                    * self.pricing.completion_per_mtok,
        };
        Ok(())
    }

    async fn next_block(&mut self) -> DomainResult<Option<AgentBlock>> {
        Ok(self.pending.pop_front())
    }

    fn last_turn_usage(&self) -> TurnUsage {
        self.last_usage
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn transcript_b64(&self) -> DomainResult<String> {
        let bytes = serde_json::to_vec(&self.history)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}
