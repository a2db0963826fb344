//! Hop, TTL and call budgets carried by every envelope.
//!
//! `check` is a pure function of the budget, the operation and the clock. It
//! never mutates its input; the accepted budget is returned as a new value.

use crate::config::BudgetConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ceiling for configured TTLs (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_hops: u32,
    pub hop_count: u32,
    /// Absolute expiry; publishes at or after this instant are refused.
    pub ttl: DateTime<Utc>,
    /// Remaining forwards that may spawn further work. `None` is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_budget_remaining: Option<u32>,
}

impl Budget {
    pub fn from_config(config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let ttl_secs = i64::try_from(config.default_ttl_secs.min(MAX_TTL_SECS)).unwrap_or(0);
        Self {
            max_hops: config.default_max_hops,
            hop_count: 0,
            ttl: now + Duration::seconds(ttl_secs),
            call_budget_remaining: config.default_call_budget,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetOperation {
    /// First hop of a fresh publish.
    Publish,
    /// Re-publish of an existing envelope; also spends one call.
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetDimension {
    Hops,
    Ttl,
    Calls,
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hops => "hops",
            Self::Ttl => "ttl",
            Self::Calls => "calls",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{dimension} budget exceeded: {detail}")]
pub struct BudgetViolation {
    pub dimension: BudgetDimension,
    pub detail: String,
}

impl BudgetViolation {
    pub fn new(dimension: BudgetDimension, detail: impl Into<String>) -> Self {
        Self {
            dimension,
            detail: detail.into(),
        }
    }
}

/// Validate `budget` for `operation` at `now` and return the budget the new
/// envelope should carry.
pub fn check(
    budget: &Budget,
    operation: BudgetOperation,
    now: DateTime<Utc>,
) -> Result<Budget, BudgetViolation> {
    if budget.is_expired(now) {
        return Err(BudgetViolation::new(
            BudgetDimension::Ttl,
            format!("expired at {}", budget.ttl.to_rfc3339()),
        ));
    }

    if budget.call_budget_remaining == Some(0) {
        return Err(BudgetViolation::new(
            BudgetDimension::Calls,
            "no calls remaining",
        ));
    }

    let next_hop = budget.hop_count.saturating_add(1);
    if next_hop > budget.max_hops {
        return Err(BudgetViolation::new(
            BudgetDimension::Hops,
            format!("hop {next_hop} exceeds max_hops {}", budget.max_hops),
        ));
    }

    let call_budget_remaining = match operation {
        BudgetOperation::Publish => budget.call_budget_remaining,
        BudgetOperation::Forward => budget.call_budget_remaining.map(|n| n - 1),
    };

    Ok(Budget {
        max_hops: budget.max_hops,
        hop_count: next_hop,
        ttl: budget.ttl,
        call_budget_remaining,
    })
}
