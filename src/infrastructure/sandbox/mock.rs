//! In-memory sandbox provider for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ResourceEnvelope;
use crate::domain::ports::{ExecResult, PreviewLink, Sandbox, SandboxProvider};

#[derive(Default)]
struct MockState {
    sandboxes: HashMap<String, Sandbox>,
    uploads: HashMap<String, Vec<String>>,
    execs: HashMap<String, Vec<String>>,
}

/// Records every provider interaction; exec always succeeds.
pub struct MockSandboxProvider {
    state: Mutex<MockState>,
    counter: AtomicU64,
    /// When > 0, the next N `create_sandbox` calls fail transiently.
    fail_creates: AtomicU64,
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            counter: AtomicU64::new(1),
            fail_creates: AtomicU64::new(0),
        }
    }

    /// Make the next `n` creations fail with a transient provider error.
    pub fn fail_next_creates(&self, n: u64) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub async fn sandbox_count(&self) -> usize {
        self.state.lock().await.sandboxes.len()
    }

    pub async fn execs_for(&self, sandbox_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .execs
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn uploads_for(&self, sandbox_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .uploads
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MockSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create_sandbox(
        &self,
        image: &str,
        _resources: ResourceEnvelope,
        labels: HashMap<String, String>,
    ) -> DomainResult<Sandbox> {
        let remaining = self.fail_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(DomainError::Provider("provider flake".to_string()));
        }

        let id = format!("mock-sandbox-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let sandbox = Sandbox {
            id: id.clone(),
            image: image.to_string(),
            labels,
        };
        self.state
            .lock()
            .await
            .sandboxes
            .insert(id, sandbox.clone());
        Ok(sandbox)
    }

    async fn upload_files(
        &self,
        sandbox: &Sandbox,
        files: HashMap<String, Vec<u8>>,
    ) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        if !state.sandboxes.contains_key(&sandbox.id) {
            return Err(DomainError::Provider(format!(
                "unknown sandbox {}",
                sandbox.id
            )));
        }
        state
            .uploads
            .entry(sandbox.id.clone())
            .or_default()
            .extend(files.into_keys());
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        _env: HashMap<String, String>,
    ) -> DomainResult<ExecResult> {
        let mut state = self.state.lock().await;
        if !state.sandboxes.contains_key(&sandbox.id) {
            return Err(DomainError::Provider(format!(
                "unknown sandbox {}",
                sandbox.id
            )));
        }
        state
            .execs
            .entry(sandbox.id.clone())
            .or_default()
            .push(command.to_string());
        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn delete(&self, sandbox_id: &str) -> DomainResult<()> {
        // Idempotent: removing an unknown sandbox is fine.
        self.state.lock().await.sandboxes.remove(sandbox_id);
        Ok(())
    }

    async fn get_preview_link(&self, sandbox: &Sandbox, port: u16) -> DomainResult<PreviewLink> {
        Ok(PreviewLink {
            url: format!("https://preview.local/{}/{port}", sandbox.id),
            token: "mock-token".to_string(),
        })
    }
}
