//! Capital ledger data model (spec section 3): the balances, reservations,
//! nonces and per-strategy metrics that live behind a [`store::CoordinationStore`].
//!
//! The ledger itself holds no behaviour beyond key naming and (de)serialising
//! its records; [`crate::budget::BudgetManager`] is the single writer that
//! mutates it under the store's locks.
pub mod store;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

/// A capital hold against a strategy's budget, made at reservation time and
/// released (committed or returned) no later than `expires_at` (spec section 4.4).
///
/// `amount` may be funded from more than one pool: `own_amount` comes out of
/// `strategy`'s own balance, `reserve_amount` out of the shared reserve buffer
/// (available to `High`/`Critical` priority requests, spec section 4.5), and
/// `cross_strategy` out of other strategies' balances (`Critical` only, spec
/// section 4.4). `release` returns each component to the pool it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub strategy: String,
    pub amount: Decimal,
    pub own_amount: Decimal,
    pub reserve_amount: Decimal,
    pub cross_strategy: Vec<(String, Decimal)>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// A reservation drawn entirely from `strategy`'s own balance.
    pub fn new(strategy: impl Into<String>, amount: Decimal, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self::with_draws(strategy, amount, amount, Decimal::ZERO, Vec::new(), now, ttl)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_draws(
        strategy: impl Into<String>,
        amount: Decimal,
        own_amount: Decimal,
        reserve_amount: Decimal,
        cross_strategy: Vec<(String, Decimal)>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            strategy: strategy.into(),
            amount,
            own_amount,
            reserve_amount,
            cross_strategy,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Rolling realized P&L for one strategy: a running day total plus a sliding
/// window deque used by the rapid-loss rule (spec section 4.6, non-goal
/// supplement: the prototype tracked both).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyMetric {
    pub trades_executed: u64,
    pub realized_pnl_today: Decimal,
    /// `(timestamp, signed pnl delta)` pairs within the rapid-loss window; older
    /// entries are pruned by [`StrategyMetric::record_fill`].
    pub recent_pnl: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl StrategyMetric {
    /// Record one settled fill's realized P&L contribution and prune entries
    /// older than `window` from the sliding deque.
    pub fn record_fill(&mut self, pnl_delta: Decimal, now: DateTime<Utc>, window: Duration) {
        self.trades_executed += 1;
        self.realized_pnl_today += pnl_delta;
        self.recent_pnl.push_back((now, pnl_delta));
        self.prune(now, window);
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        while let Some(&(ts, _)) = self.recent_pnl.front() {
            if now.signed_duration_since(ts) > window {
                self.recent_pnl.pop_front();
            } else {
                break;
            }
        }
    }

    /// Net realized P&L inside the rapid-loss window, as of `now`.
    pub fn rolling_pnl(&self, now: DateTime<Utc>, window: Duration) -> Decimal {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.recent_pnl
            .iter()
            .filter(|(ts, _)| now.signed_duration_since(*ts) <= window)
            .map(|(_, delta)| *delta)
            .sum()
    }

    pub fn reset_daily(&mut self) {
        self.realized_pnl_today = Decimal::ZERO;
    }
}

/// Point-in-time view of the ledger returned by `BudgetManager::snapshot`
/// (spec section 4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub total_capital: Decimal,
    pub available_by_strategy: std::collections::HashMap<String, Decimal>,
    pub reserved_by_strategy: std::collections::HashMap<String, Decimal>,
    pub reserve_balance: Decimal,
    pub outstanding_reservations: Vec<Reservation>,
}

/// Namespaced key names used against the [`store::CoordinationStore`], kept in
/// one place so the wire format of the shared store is documented and
/// collision-free across components.
pub mod keys {
    pub fn total_capital() -> String {
        "ledger:total_capital".to_string()
    }

    /// Shared buffer `High`/`Critical` priority reservations may draw against
    /// once their own strategy's balance is exhausted (spec section 4.5).
    pub fn reserve() -> String {
        "ledger:reserve".to_string()
    }

    pub fn available(strategy: &str) -> String {
        format!("ledger:available:{strategy}")
    }

    pub fn reserved(strategy: &str) -> String {
        format!("ledger:reserved:{strategy}")
    }

    pub fn reservation(id: &uuid::Uuid) -> String {
        format!("ledger:reservation:{id}")
    }

    pub fn reservation_index() -> String {
        "ledger:reservation_index".to_string()
    }

    pub fn nonce(wallet: &str) -> String {
        format!("ledger:nonce:{wallet}")
    }

    pub fn metric(strategy: &str) -> String {
        format!("ledger:metric:{strategy}")
    }

    pub fn budget_lock() -> &'static str {
        "ledger:lock:budget"
    }

    pub fn nonce_lock(wallet: &str) -> String {
        format!("ledger:lock:nonce:{wallet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reservation_expires_after_its_ttl() {
        let now = Utc::now();
        let reservation = Reservation::new("arb", dec!(100), now, Duration::from_secs(60));
        assert!(!reservation.is_expired(now));
        assert!(reservation.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn rolling_pnl_drops_entries_outside_the_window() {
        let mut metric = StrategyMetric::default();
        let t0 = Utc::now();
        metric.record_fill(dec!(-100), t0, Duration::from_secs(900));
        metric.record_fill(dec!(-50), t0 + chrono::Duration::minutes(10), Duration::from_secs(900));

        let later = t0 + chrono::Duration::minutes(20);
        assert_eq!(metric.rolling_pnl(later, Duration::from_secs(900)), dec!(-50));
        assert_eq!(metric.realized_pnl_today, dec!(-150));
    }
}
