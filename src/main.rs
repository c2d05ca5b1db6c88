//! Foreman CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use foreman::cli::{
    commands::{orchestrator, spec, worker},
    Cli, Commands, OrchestratorCommands, SpecCommands, SyncDirection, WorkerCommands,
};
use foreman::infrastructure::config::ConfigLoader;
use foreman::infrastructure::database::{
    DatabaseConnection, SpecRepositoryImpl, TicketRepositoryImpl,
};
use foreman::infrastructure::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Spec { command } => match command {
            SpecCommands::Show { target, dir } => {
                spec::handle_show(target, &dir, cli.json).await?;
            }
            SpecCommands::Validate { dir } => {
                let valid = spec::handle_validate(&dir, cli.json).await?;
                if !valid {
                    std::process::exit(1);
                }
            }
            SpecCommands::Sync { direction } => {
                let database_url = format!("sqlite:{}", config.database.path);
                let db = DatabaseConnection::new(&database_url)
                    .await
                    .context("Failed to connect to database")?;
                db.migrate().await.context("Failed to run migrations")?;
                let spec_repo = SpecRepositoryImpl::new(db.pool().clone());
                let ticket_repo = TicketRepositoryImpl::new(db.pool().clone());

                match direction {
                    SyncDirection::Push { dir } => {
                        spec::handle_sync_push(&dir, &spec_repo, &ticket_repo, cli.json).await?;
                    }
                    SyncDirection::Pull { dir } => {
                        spec::handle_sync_pull(&dir, &spec_repo, &ticket_repo, cli.json).await?;
                    }
                }
                db.close().await;
            }
        },
        Commands::Orchestrator { command } => match command {
            OrchestratorCommands::Start { max_agents } => {
                orchestrator::handle_start(config, max_agents).await?;
            }
        },
        Commands::Worker { command } => match command {
            WorkerCommands::Run => {
                worker::handle_run().await?;
            }
        },
    }

    Ok(())
}
