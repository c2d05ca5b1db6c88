//! Per-call cost recording and rolling budget enforcement.
//!
//! Calls are admitted by reservation: an upper-estimate is deducted from
//! every enclosing budget scope before the call proceeds, the actual is
//! settled afterwards and the difference refunded. A reservation that
//! would underflow any scope is rejected with `BudgetExhausted`. Crossing
//! a scope's alert threshold emits `budget.cost_pressure`; crossing the
//! limit emits `budget.limit_exceeded` for the guardian.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Budget, BudgetScope, CostRecord, EntityType, EventEnvelope,
};
use crate::domain::ports::CostRepository;
use crate::services::event_bus::EventBus;

/// An outstanding pre-call reservation across one or more scopes.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub amount: f64,
    /// Scopes the amount was deducted from (scopes without budgets are
    /// unconstrained and absent here)
    pub scopes: Vec<(BudgetScope, String)>,
}

/// The cost accountant (C10).
pub struct CostAccountant {
    cost_repo: Arc<dyn CostRepository>,
    bus: Arc<EventBus>,
}

impl CostAccountant {
    pub fn new(cost_repo: Arc<dyn CostRepository>, bus: Arc<EventBus>) -> Self {
        Self { cost_repo, bus }
    }

    /// Create a budget for a scope if none exists yet.
    pub async fn ensure_budget(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        limit_usd: f64,
    ) -> DomainResult<Budget> {
        if let Some(existing) = self.cost_repo.get_budget(scope, scope_id).await? {
            return Ok(existing);
        }
        let budget = Budget::new(scope, scope_id, limit_usd);
        self.cost_repo.create_budget(&budget).await?;
        Ok(budget)
    }

    /// Reserve `estimate` against every enclosing scope. All-or-nothing:
    /// on rejection, scopes reserved so far are rolled back.
    pub async fn reserve(
        &self,
        scopes: &[(BudgetScope, String)],
        estimate: f64,
    ) -> DomainResult<Reservation> {
        let mut reserved: Vec<(BudgetScope, String)> = Vec::new();

        for (scope, scope_id) in scopes {
            match self.try_reserve_scope(*scope, scope_id, estimate).await {
                Ok(true) => reserved.push((*scope, scope_id.clone())),
                Ok(false) => {} // unconstrained scope
                Err(err) => {
                    // Roll back what we already took.
                    for (done_scope, done_id) in &reserved {
                        if let Err(rollback_err) = self
                            .adjust(*done_scope, done_id, |b| b.release(estimate))
                            .await
                        {
                            warn!(error = %rollback_err, "reservation rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(Reservation {
            id: Uuid::new_v4(),
            amount: estimate,
            scopes: reserved,
        })
    }

    /// Settle a reservation: record the actual cost, refund the difference
    /// in every scope, and emit pressure events.
    pub async fn settle(
        &self,
        reservation: Reservation,
        record: CostRecord,
    ) -> DomainResult<()> {
        self.cost_repo.insert_record(&record).await?;

        for (scope, scope_id) in &reservation.scopes {
            let crossed = self
                .adjust(*scope, scope_id, |b| {
                    b.settle(reservation.amount, record.total_cost);
                })
                .await?;
            if let Some(budget) = crossed {
                self.emit_pressure(&budget).await;
            }
        }
        Ok(())
    }

    /// Release a reservation without spend (the call never happened).
    pub async fn release(&self, reservation: Reservation) -> DomainResult<()> {
        for (scope, scope_id) in &reservation.scopes {
            self.adjust(*scope, scope_id, |b| b.release(reservation.amount))
                .await?;
        }
        Ok(())
    }

    /// Remaining headroom of the tightest enclosing scope, `None` when all
    /// scopes are unconstrained.
    pub async fn remaining(
        &self,
        scopes: &[(BudgetScope, String)],
    ) -> DomainResult<Option<f64>> {
        let mut tightest: Option<f64> = None;
        for (scope, scope_id) in scopes {
            if let Some(budget) = self.cost_repo.get_budget(*scope, scope_id).await? {
                let remaining = budget.remaining();
                tightest = Some(tightest.map_or(remaining, |t: f64| t.min(remaining)));
            }
        }
        Ok(tightest)
    }

    /// Apply a closure to a budget under optimistic locking with silent
    /// retries, returning the updated budget when alert/limit thresholds
    /// are crossed.
    async fn adjust<F>(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        mutate: F,
    ) -> DomainResult<Option<Budget>>
    where
        F: Fn(&mut Budget),
    {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            let Some(mut budget) = self.cost_repo.get_budget(scope, scope_id).await? else {
                return Ok(None);
            };
            let was_over_alert = budget.over_alert_threshold();
            mutate(&mut budget);
            let crossed =
                (!was_over_alert && budget.over_alert_threshold()) || budget.exhausted();

            match self
                .cost_repo
                .update_budget_with_version_check(&budget, budget.version - 1)
                .await
            {
                Ok(()) => return Ok(crossed.then_some(budget)),
                Err(err @ DomainError::StaleWrite { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Reserve against one scope under optimistic locking; `Ok(false)`
    /// means the scope carries no budget and is unconstrained.
    async fn try_reserve_scope(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        estimate: f64,
    ) -> DomainResult<bool> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;
        loop {
            let Some(mut budget) = self.cost_repo.get_budget(scope, scope_id).await? else {
                return Ok(false);
            };
            budget.reserve(estimate)?;
            match self
                .cost_repo
                .update_budget_with_version_check(&budget, budget.version - 1)
                .await
            {
                Ok(()) => return Ok(true),
                Err(err @ DomainError::StaleWrite { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn emit_pressure(&self, budget: &Budget) {
        let event_type = if budget.exhausted() {
            "budget.limit_exceeded"
        } else {
            "budget.cost_pressure"
        };
        let envelope = EventEnvelope::new(
            event_type,
            EntityType::Budget,
            format!("{}:{}", budget.scope.as_str(), budget.scope_id),
            json!({
                "scope": budget.scope.as_str(),
                "scope_id": budget.scope_id,
                "limit_usd": budget.limit_usd,
                "spent_usd": budget.spent_usd,
            }),
        );
        if let Err(err) = self.bus.publish(envelope).await {
            warn!(error = %err, "failed to publish budget event");
        }
    }
}
