//! Scripted agent driver for tests.
//!
//! Sessions replay pre-loaded turns of blocks and record every prompt
//! they receive, so worker tests can assert on injected continuations.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::ports::{
    AgentBlock, AgentDriver, AgentSession, SessionOptions, TurnUsage,
};

/// One pre-scripted turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub blocks: Vec<AgentBlock>,
    pub usage: TurnUsage,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![AgentBlock::Text { text: text.into() }],
            usage: TurnUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                cost_usd: 0.01,
            },
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.usage.cost_usd = cost_usd;
        self
    }
}

/// Factory handing out sessions that share one scripted turn queue.
pub struct ScriptedAgentDriver {
    turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAgentDriver {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every prompt delivered to any session, in order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl AgentDriver for ScriptedAgentDriver {
    async fn open_session(&self, _options: SessionOptions) -> DomainResult<Box<dyn AgentSession>> {
        Ok(Box::new(ScriptedSession {
            turns: self.turns.clone(),
            prompts: self.prompts.clone(),
            pending: VecDeque::new(),
            last_usage: TurnUsage::default(),
            session_id: format!("scripted-{}", Uuid::new_v4()),
            transcript: Vec::new(),
        }))
    }
}

struct ScriptedSession {
    turns: Arc<Mutex<VecDeque<ScriptedTurn>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    pending: VecDeque<AgentBlock>,
    last_usage: TurnUsage,
    session_id: String,
    transcript: Vec<String>,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn send_user(&mut self, text: &str) -> DomainResult<()> {
        self.prompts.lock().await.push(text.to_string());
        self.transcript.push(format!("user: {text}"));

        let turn = self.turns.lock().await.pop_front().unwrap_or_else(|| {
            ScriptedTurn::text("(no further scripted output)")
        });
        for block in &turn.blocks {
            if let AgentBlock::Text { text } = block {
                self.transcript.push(format!("assistant: {text}"));
            }
        }
        self.pending = turn.blocks.into();
        self.last_usage = turn.usage;
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
        let joined = self.transcript.join("\n");
        Ok(base64::engine::general_purpose::STANDARD.encode(joined))
    }
}
