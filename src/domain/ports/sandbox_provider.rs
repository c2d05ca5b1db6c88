//! Narrow interface to the external sandbox provider.
//!
//! Implementations must make `delete` idempotent: deleting an unknown or
//! already-deleted sandbox succeeds.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::ResourceEnvelope;

/// Handle to a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Result of executing a command inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Preview link for a port exposed by a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLink {
    pub url: String,
    pub token: String,
}

/// The sandbox provider boundary contract.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_sandbox(
        &self,
        image: &str,
        resources: ResourceEnvelope,
        labels: HashMap<String, String>,
    ) -> DomainResult<Sandbox>;

    async fn upload_files(
        &self,
        sandbox: &Sandbox,
        files: HashMap<String, Vec<u8>>,
    ) -> DomainResult<()>;

    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        env: HashMap<String, String>,
    ) -> DomainResult<ExecResult>;

    /// Idempotent: deleting an unknown sandbox succeeds.
    async fn delete(&self, sandbox_id: &str) -> DomainResult<()>;

    async fn get_preview_link(&self, sandbox: &Sandbox, port: u16) -> DomainResult<PreviewLink>;
}
