//! HTTP-backed sandbox provider (§6.2).
//!
//! Talks to an external provider over a narrow REST surface. Delete is
//! idempotent: a 404 on delete is success.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ResourceEnvelope;
use crate::domain::ports::{ExecResult, PreviewLink, Sandbox, SandboxProvider};

pub struct HttpSandboxProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct ExecResponse {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

#[derive(Deserialize)]
struct PreviewResponse {
    url: String,
    token: String,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> DomainResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(DomainError::Provider(format!("{status}: {body}")))
        } else {
            Err(DomainError::ValidationFailed(format!(
                "sandbox provider rejected request: {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create_sandbox(
        &self,
        image: &str,
        resources: ResourceEnvelope,
        labels: HashMap<String, String>,
    ) -> DomainResult<Sandbox> {
        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&json!({
                "image": image,
                "resources": resources,
                "labels": labels,
            }))
            .send()
            .await
            .map_err(|e| DomainError::Provider(e.to_string()))?;
        let created: CreateResponse = Self::check(response).await?.json().await?;
        Ok(Sandbox {
            id: created.id,
            image: image.to_string(),
            labels,
        })
    }

    async fn upload_files(
        &self,
        sandbox: &Sandbox,
        files: HashMap<String, Vec<u8>>,
    ) -> DomainResult<()> {
        let encoded: HashMap<String, String> = files
            .into_iter()
            .map(|(path, bytes)| {
                (
                    path,
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                )
            })
            .collect();
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/files", sandbox.id),
            )
            .json(&json!({"files": encoded}))
            .send()
            .await
            .map_err(|e| DomainError::Provider(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        env: HashMap<String, String>,
    ) -> DomainResult<ExecResult> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/exec", sandbox.id),
            )
            .json(&json!({"command": command, "env": env}))
            .send()
            .await
            .map_err(|e| DomainError::Provider(e.to_string()))?;
        let result: ExecResponse = Self::check(response).await?.json().await?;
        Ok(ExecResult {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
        })
    }

    async fn delete(&self, sandbox_id: &str) -> DomainResult<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await
            .map_err(|e| DomainError::Provider(e.to_string()))?;
        // Idempotent: already-gone is success.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn get_preview_link(&self, sandbox: &Sandbox, port: u16) -> DomainResult<PreviewLink> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/sandboxes/{}/preview/{port}", sandbox.id),
            )
            .send()
            .await
            .map_err(|e| DomainError::Provider(e.to_string()))?;
        let preview: PreviewResponse = Self::check(response).await?.json().await?;
        Ok(PreviewLink {
            url: preview.url,
            token: preview.token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_exec() {
        let mut server = mockito::Server::new_async().await;
        let _create = server
            .mock("POST", "/sandboxes")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body("{\"id\": \"sb-99\"}")
            .create_async()
            .await;
        let _exec = server
            .mock("POST", "/sandboxes/sb-99/exec")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"stdout\": \"hi\", \"stderr\": \"\", \"exit_code\": 0}")
            .create_async()
            .await;

        let provider = HttpSandboxProvider::new(server.url(), None).unwrap();
        let sandbox = provider
            .create_sandbox("img", ResourceEnvelope::default(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(sandbox.id, "sb-99");

        let result = provider
            .exec(&sandbox, "echo hi", HashMap::new())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hi");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_on_404() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/sandboxes/gone")
            .with_status(404)
            .create_async()
            .await;

        let provider = HttpSandboxProvider::new(server.url(), None).unwrap();
        provider.delete("gone").await.unwrap();
    }
}
