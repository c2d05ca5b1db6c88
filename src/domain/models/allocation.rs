//! Sandbox resource allocations.
//!
//! Current vs pending envelopes allow resize requests to be staged by the
//! guardian and applied by the provider without losing the last known-good
//! values. Rows are updated under optimistic locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A resource envelope for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            cpu_cores: 2.0,
            memory_mb: 4096,
            disk_gb: 20,
        }
    }
}

/// Current and pending resources for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResourceAllocation {
    pub sandbox_id: String,
    pub current: ResourceEnvelope,
    /// Staged resize, applied by the provider then promoted to `current`
    pub pending: Option<ResourceEnvelope>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl SandboxResourceAllocation {
    pub fn new(sandbox_id: impl Into<String>, current: ResourceEnvelope) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            current,
            pending: None,
            updated_by: "orchestrator".to_string(),
            updated_at: Utc::now(),
            version: 1,
        }
    }

    /// Stage a resize request.
    pub fn stage_resize(&mut self, envelope: ResourceEnvelope, updated_by: impl Into<String>) {
        self.pending = Some(envelope);
        self.updated_by = updated_by.into();
        self.touch();
    }

    /// Promote the staged envelope after the provider applied it.
    pub fn apply_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(envelope) => {
                self.current = envelope;
                self.touch();
                true
            }
            None => false,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_apply_resize() {
        let mut alloc = SandboxResourceAllocation::new("sb-1", ResourceEnvelope::default());
        let bigger = ResourceEnvelope {
            cpu_cores: 4.0,
            memory_mb: 8192,
            disk_gb: 40,
        };
        alloc.stage_resize(bigger, "guardian");
        assert!(alloc.pending.is_some());
        assert_eq!(alloc.updated_by, "guardian");

        assert!(alloc.apply_pending());
        assert_eq!(alloc.current, bigger);
        assert!(alloc.pending.is_none());
        // Second apply is a no-op
        assert!(!alloc.apply_pending());
    }
}
