//! Foreman — orchestration kernel for sandboxed coding agents.
//!
//! - Dynamic score-based task scheduling with dependency gating
//! - Agent lifecycle state machine with heartbeat and anomaly monitoring
//! - Sandbox worker runtime with message injection and budget caps
//! - Five-phase spec workflow (explore → requirements → design → tasks → sync)
//! - Guardian interventions and convergence merges, audited end to end
//! - SQLite entity store with optimistic locking

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
pub mod worker;

pub use infrastructure::database::DatabaseConnection;
