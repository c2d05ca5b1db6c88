//! Coding-agent driver port.
//!
//! The sandbox worker drives one streaming conversation at a time. A turn
//! starts with `send_user` and ends when `next_block` returns `None`; the
//! worker pumps every block to the event reporter as it arrives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;

/// Token/cost usage for one completed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl TurnUsage {
    pub fn add(&mut self, other: TurnUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// A file modification observed inside a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub before: String,
    pub after: String,
}

/// One streamed block produced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
        /// Present for write/edit tools; the worker renders it as a
        /// unified diff in the reported event
        file_change: Option<FileChange>,
    },
}

/// Options for opening a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub cwd: Option<String>,
    /// Resume a previous conversation by provider session id
    pub resume_session_id: Option<String>,
    /// Hydrate from a base64 transcript (cross-sandbox resumption)
    pub session_transcript_b64: Option<String>,
}

/// An open streaming conversation with the coding agent.
#[async_trait]
pub trait AgentSession: Send {
    /// Deliver a user/continuation message, starting a new turn.
    async fn send_user(&mut self, text: &str) -> DomainResult<()>;

    /// Next streamed block of the current turn; `None` once the turn is
    /// complete.
    async fn next_block(&mut self) -> DomainResult<Option<AgentBlock>>;

    /// Usage of the most recently completed turn.
    fn last_turn_usage(&self) -> TurnUsage;

    /// Provider-side session id, for resumption.
    fn session_id(&self) -> &str;

    /// Base64 transcript snapshot for cross-sandbox resumption.
    fn transcript_b64(&self) -> DomainResult<String>;
}

/// Factory for agent sessions.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn open_session(&self, options: SessionOptions) -> DomainResult<Box<dyn AgentSession>>;
}
