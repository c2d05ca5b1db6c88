//! `foreman worker run` — the entry point executed inside the sandbox.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::infrastructure::agent::HttpAgentDriver;
use crate::infrastructure::http::CallbackClient;
use crate::worker::reporter::{HttpReporter, JsonlReporter};
use crate::worker::{SandboxWorker, WorkerConfig};

pub async fn handle_run() -> Result<()> {
    let config = WorkerConfig::from_env().context("failed to load worker config")?;
    info!(sandbox_id = %config.sandbox_id, "sandbox worker booting");

    let api = Arc::new(
        CallbackClient::new(config.callback_url.clone())
            .context("failed to build callback client")?,
    );

    let reporter: Arc<dyn crate::domain::ports::EventReporter> =
        match config.reporter_mode.as_str() {
            "jsonl" => Arc::new(JsonlReporter::new(
                config.output_directory.join("events.jsonl"),
            )),
            _ => Arc::new(HttpReporter::new(api.clone())),
        };

    let api_key = config
        .api_key
        .clone()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .context("no API key configured for the agent driver")?;
    let base_url = std::env::var("ANTHROPIC_BASE_URL")
        .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| "claude-sonnet-4-5".to_string());
    let driver = Arc::new(
        HttpAgentDriver::new(base_url, api_key, model).context("failed to build agent driver")?,
    );

    let worker = SandboxWorker::new(config, driver, reporter, api);
    let outcome = worker.run().await.context("worker run failed")?;
    info!(
        final_event = %outcome.final_event,
        turns = outcome.turns,
        cost_usd = outcome.usage.cost_usd,
        "sandbox worker finished"
    );
    Ok(())
}
