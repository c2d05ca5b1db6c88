//! Domain errors for the Foreman orchestration kernel.
//!
//! Error kinds follow three classes: transient (retry with backoff),
//! permanent (terminal), and domain (surfaced to the user). Each enum
//! exposes `is_transient` / `is_permanent` so callers can route retries
//! without matching on individual variants.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors shared across services and repositories.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Ticket not found: {0}")]
    TicketNotFound(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Spec not found: {0}")]
    SpecNotFound(Uuid),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Stale write: {entity} {id} was modified concurrently")]
    StaleWrite { entity: &'static str, id: String },

    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Unresolved reference: {kind} {id}")]
    MissingReference { kind: String, id: String },

    #[error("Budget exhausted for {scope}: requested {requested:.4}, remaining {remaining:.4}")]
    BudgetExhausted {
        scope: String,
        requested: f64,
        remaining: f64,
    },

    #[error("Heartbeat checksum mismatch for agent {0}")]
    ChecksumMismatch(Uuid),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Sandbox provider error: {0}")]
    Provider(String),

    #[error("Agent driver error: {0}")]
    Driver(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DomainError {
    /// Transient errors may succeed on retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StaleWrite { .. } | Self::Provider(_) | Self::Http(_) | Self::Database(_)
        )
    }

    /// Permanent errors must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::BudgetExhausted { .. }
                | Self::ChecksumMismatch(_)
                | Self::ValidationFailed(_)
                | Self::DependencyCycle(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
