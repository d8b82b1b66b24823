// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-cost
#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::Contract;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

// Warning fires at this fraction of any limit.
const WARNING_THRESHOLD: f64 = 0.8;

/// Thread-safe per-run cost accumulator.
///
/// Stores compute and API cents in separate atomics; the total is always
/// their sum, never stored, so the cost identity cannot drift.
///
/// # Examples
///
/// ```
/// use acp_cost::{CostTracker, BudgetStatus};
///
/// let tracker = CostTracker::new(Some(100));
/// tracker.record(40, 20);
/// assert_eq!(tracker.total_cents(), 60);
/// assert!(matches!(tracker.check(), BudgetStatus::WithinLimits));
///
/// tracker.record(50, 0);
/// assert!(matches!(tracker.check(), BudgetStatus::Exceeded(_)));
/// ```
pub struct CostTracker {
    max_cost_cents: Option<u64>,
    compute_cents: AtomicU64,
    api_cents: AtomicU64,
}

impl fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostTracker")
            .field("max_cost_cents", &self.max_cost_cents)
            .field("compute_cents", &self.compute_cents.load(Relaxed))
            .field("api_cents", &self.api_cents.load(Relaxed))
            .finish()
    }
}

impl CostTracker {
    /// Create a tracker with an optional hard cap.
    #[must_use]
    pub fn new(max_cost_cents: Option<u64>) -> Self {
        Self {
            max_cost_cents,
            compute_cents: AtomicU64::new(0),
            api_cents: AtomicU64::new(0),
        }
    }

    /// Create a tracker enforcing a contract's `max_cost_cents`.
    #[must_use]
    pub fn for_contract(contract: &Contract) -> Self {
        Self::new(contract.max_cost_cents)
    }

    /// Record cost deltas.
    pub fn record(&self, d_compute_cents: u64, d_api_cents: u64) {
        self.compute_cents.fetch_add(d_compute_cents, Relaxed);
        self.api_cents.fetch_add(d_api_cents, Relaxed);
    }

    /// Accumulated compute spend.
    #[must_use]
    pub fn compute_cents(&self) -> u64 {
        self.compute_cents.load(Relaxed)
    }

    /// Accumulated API spend.
    #[must_use]
    pub fn api_cents(&self) -> u64 {
        self.api_cents.load(Relaxed)
    }

    /// Total spend, recomputed from the two accumulators.
    #[must_use]
    pub fn total_cents(&self) -> u64 {
        self.compute_cents() + self.api_cents()
    }

    /// Check current spend against the cap.
    #[must_use]
    pub fn check(&self) -> BudgetStatus {
        let total = self.total_cents();
        let Some(limit) = self.max_cost_cents else {
            return BudgetStatus::WithinLimits;
        };
        if total > limit {
            return BudgetStatus::Exceeded(BudgetViolation {
                used_cents: total,
                limit_cents: limit,
            });
        }
        if total as f64 >= limit as f64 * WARNING_THRESHOLD {
            return BudgetStatus::Approaching {
                used_cents: total,
                limit_cents: limit,
            };
        }
        BudgetStatus::WithinLimits
    }
}

/// Result of checking spend against a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Spend is comfortably under every limit.
    WithinLimits,
    /// Spend crossed 80% of a limit.
    Approaching {
        /// Current spend.
        used_cents: u64,
        /// The limit being approached.
        limit_cents: u64,
    },
    /// A hard limit was exceeded; the run must terminate.
    Exceeded(BudgetViolation),
}

/// A hard budget violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetViolation {
    /// Spend at the moment of violation.
    pub used_cents: u64,
    /// The limit that was exceeded.
    pub limit_cents: u64,
}

impl fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spent {} cents against a limit of {} cents",
            self.used_cents, self.limit_cents
        )
    }
}

/// Per-day / per-month workspace budget caps. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceBudget {
    /// Cap on spend per calendar day (UTC).
    pub per_day_cents: Option<u64>,
    /// Cap on spend per calendar month (UTC).
    pub per_month_cents: Option<u64>,
}

/// Process-wide accumulator enforcing [`WorkspaceBudget`]s.
///
/// Keyed by workspace id; day and month windows roll over on the UTC
/// calendar.
#[derive(Debug, Default)]
pub struct WorkspaceSpend {
    budgets: HashMap<String, WorkspaceBudget>,
    // (workspace, yyyy-ddd) → cents and (workspace, yyyy-mm) → cents.
    by_day: Mutex<HashMap<(String, String), u64>>,
    by_month: Mutex<HashMap<(String, String), u64>>,
}

impl WorkspaceSpend {
    /// Create an accumulator with the given per-workspace budgets.
    #[must_use]
    pub fn new(budgets: HashMap<String, WorkspaceBudget>) -> Self {
        Self {
            budgets,
            by_day: Mutex::new(HashMap::new()),
            by_month: Mutex::new(HashMap::new()),
        }
    }

    fn day_key(now: DateTime<Utc>) -> String {
        format!("{}-{:03}", now.year(), now.ordinal())
    }

    fn month_key(now: DateTime<Utc>) -> String {
        format!("{}-{:02}", now.year(), now.month())
    }

    /// Record spend for a workspace at `now`.
    pub fn record(&self, workspace_id: &str, cents: u64, now: DateTime<Utc>) {
        let mut by_day = self.by_day.lock().expect("day lock poisoned");
        *by_day
            .entry((workspace_id.to_string(), Self::day_key(now)))
            .or_insert(0) += cents;
        drop(by_day);

        let mut by_month = self.by_month.lock().expect("month lock poisoned");
        *by_month
            .entry((workspace_id.to_string(), Self::month_key(now)))
            .or_insert(0) += cents;
    }

    /// Check whether admitting `additional_cents` of spend would break a
    /// workspace budget at `now`.
    #[must_use]
    pub fn precheck(
        &self,
        workspace_id: &str,
        additional_cents: u64,
        now: DateTime<Utc>,
    ) -> BudgetStatus {
        let Some(budget) = self.budgets.get(workspace_id) else {
            return BudgetStatus::WithinLimits;
        };

        if let Some(limit) = budget.per_day_cents {
            let spent = self
                .by_day
                .lock()
                .expect("day lock poisoned")
                .get(&(workspace_id.to_string(), Self::day_key(now)))
                .copied()
                .unwrap_or(0);
            if spent + additional_cents > limit {
                return BudgetStatus::Exceeded(BudgetViolation {
                    used_cents: spent + additional_cents,
                    limit_cents: limit,
                });
            }
        }

        if let Some(limit) = budget.per_month_cents {
            let spent = self
                .by_month
                .lock()
                .expect("month lock poisoned")
                .get(&(workspace_id.to_string(), Self::month_key(now)))
                .copied()
                .unwrap_or(0);
            if spent + additional_cents > limit {
                return BudgetStatus::Exceeded(BudgetViolation {
                    used_cents: spent + additional_cents,
                    limit_cents: limit,
                });
            }
        }

        BudgetStatus::WithinLimits
    }
}

/// Pre-run cost estimate with a variance band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Point estimate.
    pub expected_cents: u64,
    /// Lower bound of the band.
    pub low_cents: u64,
    /// Upper bound of the band.
    pub high_cents: u64,
}

// Default point estimate when the contract has no cost cap to anchor on.
const DEFAULT_ESTIMATE_CENTS: u64 = 50;

/// Estimate a contract's cost before the run starts.
///
/// Anchored on `max_cost_cents` when set (runs typically land well under
/// their cap), otherwise a flat default scaled by deliverable count. The
/// band is ±50% of the point estimate.
#[must_use]
pub fn estimate(contract: &Contract) -> CostEstimate {
    let expected = match contract.max_cost_cents {
        Some(cap) => (cap / 2).max(1),
        None => DEFAULT_ESTIMATE_CENTS * contract.deliverables.len().max(1) as u64,
    };
    CostEstimate {
        expected_cents: expected,
        low_cents: expected / 2,
        high_cents: expected + expected / 2,
    }
}

/// Estimate-vs-actual comparison recorded on the trace after the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostReconciliation {
    /// The pre-run estimate.
    pub estimate: CostEstimate,
    /// What the run actually spent.
    pub actual_cents: u64,
    /// `actual − expected`; negative when the run came in under.
    pub delta_cents: i64,
    /// Whether the actual landed inside the estimate band.
    pub within_band: bool,
}

/// Compare an estimate to the actual spend.
#[must_use]
pub fn reconcile(estimate: CostEstimate, actual_cents: u64) -> CostReconciliation {
    let delta_cents = actual_cents as i64 - estimate.expected_cents as i64;
    let within_band = actual_cents >= estimate.low_cents && actual_cents <= estimate.high_cents;
    CostReconciliation {
        estimate,
        actual_cents,
        delta_cents,
        within_band,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::ContractBuilder;

    #[test]
    fn totals_are_recomputed() {
        let t = CostTracker::new(None);
        t.record(10, 0);
        t.record(0, 7);
        t.record(3, 3);
        assert_eq!(t.compute_cents(), 13);
        assert_eq!(t.api_cents(), 10);
        assert_eq!(t.total_cents(), 23);
    }

    #[test]
    fn no_cap_never_exceeds() {
        let t = CostTracker::new(None);
        t.record(1_000_000, 1_000_000);
        assert_eq!(t.check(), BudgetStatus::WithinLimits);
    }

    #[test]
    fn warning_fires_at_80_percent() {
        let t = CostTracker::new(Some(100));
        t.record(79, 0);
        assert_eq!(t.check(), BudgetStatus::WithinLimits);
        t.record(1, 0);
        assert!(matches!(t.check(), BudgetStatus::Approaching { .. }));
    }

    #[test]
    fn exactly_at_limit_is_not_exceeded() {
        let t = CostTracker::new(Some(100));
        t.record(60, 40);
        assert!(matches!(t.check(), BudgetStatus::Approaching { .. }));
        t.record(1, 0);
        let BudgetStatus::Exceeded(v) = t.check() else {
            panic!("expected exceeded");
        };
        assert_eq!(v.used_cents, 101);
        assert_eq!(v.limit_cents, 100);
    }

    #[test]
    fn tracker_from_contract_uses_cap() {
        let contract = ContractBuilder::new("g").max_cost_cents(42).build();
        let t = CostTracker::for_contract(&contract);
        t.record(43, 0);
        assert!(matches!(t.check(), BudgetStatus::Exceeded(_)));
    }

    #[test]
    fn workspace_day_budget_enforced() {
        let mut budgets = HashMap::new();
        budgets.insert(
            "ws-1".to_string(),
            WorkspaceBudget {
                per_day_cents: Some(100),
                per_month_cents: None,
            },
        );
        let spend = WorkspaceSpend::new(budgets);
        let now = Utc::now();

        assert_eq!(spend.precheck("ws-1", 90, now), BudgetStatus::WithinLimits);
        spend.record("ws-1", 90, now);
        assert!(matches!(
            spend.precheck("ws-1", 20, now),
            BudgetStatus::Exceeded(_)
        ));
        // Unbudgeted workspaces are unconstrained.
        assert_eq!(
            spend.precheck("ws-other", 10_000, now),
            BudgetStatus::WithinLimits
        );
    }

    #[test]
    fn estimate_anchors_on_cap() {
        let capped = ContractBuilder::new("g").max_cost_cents(200).build();
        let e = estimate(&capped);
        assert_eq!(e.expected_cents, 100);
        assert_eq!(e.low_cents, 50);
        assert_eq!(e.high_cents, 150);

        let uncapped = ContractBuilder::new("g")
            .deliverable("D1", "markdown", "a.md", true)
            .deliverable("D2", "markdown", "b.md", true)
            .build();
        assert_eq!(estimate(&uncapped).expected_cents, 100);
    }

    #[test]
    fn reconcile_reports_band_and_delta() {
        let e = CostEstimate {
            expected_cents: 100,
            low_cents: 50,
            high_cents: 150,
        };
        let r = reconcile(e.clone(), 80);
        assert_eq!(r.delta_cents, -20);
        assert!(r.within_band);

        let r = reconcile(e, 200);
        assert_eq!(r.delta_cents, 100);
        assert!(!r.within_band);
    }
}
