//! Cost records and budget scopes.
//!
//! Every LLM call produces a `CostRecord` linked to a task. Budgets hold a
//! limit per scope and enforce reservation-before-call semantics: the
//! accountant deducts an upper-estimate reservation, settles the actual on
//! completion, and refunds the difference. `spent + reserved` never exceeds
//! `limit`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// One LLM call's token and cost accounting. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
    pub sandbox_id: Option<String>,
    pub billing_account: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CostRecord {
    pub fn new(
        task_id: Uuid,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        prompt_cost: f64,
        completion_cost: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            agent_id: None,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            prompt_cost,
            completion_cost,
            total_cost: prompt_cost + completion_cost,
            sandbox_id: None,
            billing_account: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }
}

/// Scope a budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Task,
    Agent,
    Project,
    Account,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Agent => "agent",
            Self::Project => "project",
            Self::Account => "account",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "agent" => Some(Self::Agent),
            "project" => Some(Self::Project),
            "account" => Some(Self::Account),
            _ => None,
        }
    }
}

/// Budget reset period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    /// Never resets
    Total,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Total => "total",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "total" => Some(Self::Total),
            _ => None,
        }
    }
}

/// A spending limit over a scope, with live reservation bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub scope: BudgetScope,
    /// Scope identifier (task/agent/project/account id as string)
    pub scope_id: String,
    pub limit_usd: f64,
    pub spent_usd: f64,
    /// Outstanding pre-call reservations
    pub reserved_usd: f64,
    pub period: BudgetPeriod,
    /// Fraction of the limit at which `cost_pressure` is emitted
    pub alert_threshold: f64,
    pub period_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Budget {
    pub fn new(scope: BudgetScope, scope_id: impl Into<String>, limit_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope,
            scope_id: scope_id.into(),
            limit_usd,
            spent_usd: 0.0,
            reserved_usd: 0.0,
            period: BudgetPeriod::Total,
            alert_threshold: 0.8,
            period_started_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn with_period(mut self, period: BudgetPeriod) -> Self {
        self.period = period;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: f64) -> Self {
        self.alert_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Remaining headroom: limit minus spend minus outstanding reservations.
    pub fn remaining(&self) -> f64 {
        (self.limit_usd - self.spent_usd - self.reserved_usd).max(0.0)
    }

    /// Deduct a pre-call reservation. Rejects a reservation that would
    /// underflow the budget.
    pub fn reserve(&mut self, amount: f64) -> DomainResult<()> {
        if amount > self.limit_usd - self.spent_usd - self.reserved_usd {
            return Err(DomainError::BudgetExhausted {
                scope: format!("{}:{}", self.scope.as_str(), self.scope_id),
                requested: amount,
                remaining: self.remaining(),
            });
        }
        self.reserved_usd += amount;
        self.touch();
        Ok(())
    }

    /// Settle a reservation against the actual spend, refunding the
    /// difference. The actual may exceed the reservation (estimates are
    /// upper bounds, but providers occasionally surprise); the overrun is
    /// still recorded so `spent` matches the cost ledger.
    pub fn settle(&mut self, reserved: f64, actual: f64) {
        self.reserved_usd = (self.reserved_usd - reserved).max(0.0);
        self.spent_usd += actual;
        self.touch();
    }

    /// Release a reservation without spend (call failed before issue).
    pub fn release(&mut self, reserved: f64) {
        self.reserved_usd = (self.reserved_usd - reserved).max(0.0);
        self.touch();
    }

    /// Whether spend has crossed the alert threshold.
    pub fn over_alert_threshold(&self) -> bool {
        self.limit_usd > 0.0 && self.spent_usd >= self.limit_usd * self.alert_threshold
    }

    /// Whether the spend has reached or passed the hard limit.
    pub fn exhausted(&self) -> bool {
        self.spent_usd >= self.limit_usd
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
    fn test_cost_record_totals() {
        let record = CostRecord::new(Uuid::new_v4(), "anthropic", "sonnet", 1000, 500, 0.03, 0.15);
        assert!((record.total_cost - 0.18).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_settle_refund() {
        let mut budget = Budget::new(BudgetScope::Task, "t1", 1.0);
        budget.reserve(0.5).unwrap();
        assert!((budget.remaining() - 0.5).abs() < 1e-9);

        budget.settle(0.5, 0.3);
        assert!((budget.spent_usd - 0.3).abs() < 1e-9);
        assert!(budget.reserved_usd.abs() < 1e-9);
        assert!((budget.remaining() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_underflow_rejected() {
        let mut budget = Budget::new(BudgetScope::Task, "t1", 1.0);
        budget.reserve(0.4).unwrap();
        budget.settle(0.4, 0.4);
        budget.reserve(0.4).unwrap();
        budget.settle(0.4, 0.4);

        // 0.8 spent of 1.0; a 0.3 reservation would underflow
        let err = budget.reserve(0.3).unwrap_err();
        assert!(matches!(err, DomainError::BudgetExhausted { .. }));
        // Rejection does not mutate
        assert!((budget.spent_usd - 0.8).abs() < 1e-9);
        assert!(budget.reserved_usd.abs() < 1e-9);
    }

    #[test]
    fn test_spent_plus_reserved_never_exceeds_limit() {
        let mut budget = Budget::new(BudgetScope::Agent, "a1", 2.0);
        budget.reserve(1.0).unwrap();
        budget.reserve(1.0).unwrap();
        assert!(budget.reserve(0.01).is_err());
        assert!(budget.spent_usd + budget.reserved_usd <= budget.limit_usd + 1e-9);
    }

    #[test]
    fn test_release_returns_headroom() {
        let mut budget = Budget::new(BudgetScope::Task, "t1", 1.0);
        budget.reserve(0.9).unwrap();
        budget.release(0.9);
        assert!((budget.remaining() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_threshold() {
        let mut budget = Budget::new(BudgetScope::Project, "p1", 10.0).with_alert_threshold(0.8);
        budget.settle(0.0, 7.9);
        assert!(!budget.over_alert_threshold());
        budget.settle(0.0, 0.2);
        assert!(budget.over_alert_threshold());
        assert!(!budget.exhausted());
        budget.settle(0.0, 2.0);
        assert!(budget.exhausted());
    }
}
