//! Operator CLI.

pub mod commands;
pub mod display;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Orchestration kernel for sandboxed coding agents.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect, validate, and sync local spec artifacts
    Spec {
        #[command(subcommand)]
        command: SpecCommands,
    },
    /// Run the orchestrator
    Orchestrator {
        #[command(subcommand)]
        command: OrchestratorCommands,
    },
    /// Run the sandbox worker (configured from the environment)
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SpecCommands {
    /// List or inspect local artifacts
    Show {
        #[arg(value_enum, default_value_t = ShowTarget::All)]
        target: ShowTarget,
        /// Artifact directory
        #[arg(long, default_value = ".spec-output")]
        dir: PathBuf,
    },
    /// Run the artifact graph checks; exit 0 iff all invariants hold
    Validate {
        #[arg(long, default_value = ".spec-output")]
        dir: PathBuf,
    },
    /// Mediate local artifacts with the entity store
    Sync {
        #[command(subcommand)]
        direction: SyncDirection,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShowTarget {
    All,
    Tickets,
    Tasks,
    Ready,
    Graph,
}

#[derive(Subcommand, Debug)]
pub enum SyncDirection {
    /// Upload local artifacts into the entity store
    Push {
        #[arg(long, default_value = ".spec-output")]
        dir: PathBuf,
    },
    /// Materialize store state as local artifacts
    Pull {
        #[arg(long, default_value = ".spec-output")]
        dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum OrchestratorCommands {
    /// Start the orchestrator loop
    Start {
        /// Override the configured maximum concurrent agents
        #[arg(long)]
        max_agents: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Run the sandbox worker until the task terminates
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec_show() {
        let cli = Cli::try_parse_from(["foreman", "spec", "show", "tickets"]).unwrap();
        match cli.command {
            Commands::Spec {
                command: SpecCommands::Show { target, .. },
            } => assert_eq!(target, ShowTarget::Tickets),
            _ => panic!("wrong parse"),
        }
    }

    #[test]
    fn test_parse_spec_validate_with_dir() {
        let cli =
            Cli::try_parse_from(["foreman", "spec", "validate", "--dir", "out"]).unwrap();
        match cli.command {
            Commands::Spec {
                command: SpecCommands::Validate { dir },
            } => assert_eq!(dir, PathBuf::from("out")),
            _ => panic!("wrong parse"),
        }
    }

    #[test]
    fn test_parse_sync_push() {
        let cli = Cli::try_parse_from(["foreman", "spec", "sync", "push"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Spec {
                command: SpecCommands::Sync {
                    direction: SyncDirection::Push { .. }
                }
            }
        ));
    }

    #[test]
    fn test_parse_orchestrator_start() {
        let cli =
            Cli::try_parse_from(["foreman", "orchestrator", "start", "--max-agents", "4"])
                .unwrap();
        match cli.command {
            Commands::Orchestrator {
                command: OrchestratorCommands::Start { max_agents },
            } => assert_eq!(max_agents, Some(4)),
            _ => panic!("wrong parse"),
        }
    }
}
