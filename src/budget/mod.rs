//! Capital allocation and reservation (spec section 4.4/4.5): the single
//! writer of the shared capital ledger. Mirrors the teacher's `MetaPortfolio<T>`
//! in being generic over its persistence layer, but keeps reservation and
//! nonce bookkeeping in-process (spec section 5: one `BudgetManager` task per
//! process; the store only coordinates `total_capital`/`available` balances
//! and nonces across processes sharing one capital pool).
use crate::config::{AllocationConfig, BudgetConfig};
use crate::error::DenyReason;
use crate::ledger::store::{CoordinationStore, StoreError};
use crate::ledger::{keys, LedgerSnapshot, Reservation, StrategyMetric};
use crate::signal::Priority;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("strategy '{0}' has no allocation configured")]
    UnknownStrategy(String),

    #[error("ledger already initialised; refusing to overwrite without --reset")]
    AlreadyInitialised,
}

/// Single-writer capital ledger. The store holds `total_capital` and each
/// strategy's `available` balance so multiple swarm processes can share a
/// capital pool (spec section 6.4); reservations and per-strategy metrics are
/// this process's own bookkeeping, guarded by `parking_lot::Mutex` per the
/// single-task-ownership concurrency model (spec section 5).
pub struct BudgetManager<S: CoordinationStore> {
    store: Arc<S>,
    allocation: AllocationConfig,
    config: BudgetConfig,
    reservations: Mutex<HashMap<Uuid, Reservation>>,
    metrics: Mutex<HashMap<String, StrategyMetric>>,
}

impl<S: CoordinationStore> BudgetManager<S> {
    pub fn new(store: Arc<S>, allocation: AllocationConfig, config: BudgetConfig) -> Self {
        Self {
            store,
            allocation,
            config,
            reservations: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Seed `total_capital` and each strategy's `available` balance from the
    /// configured allocation fractions. `force` corresponds to `--reset`
    /// (spec section 6.5); without it, a ledger that already has a
    /// `total_capital` entry is left untouched and this call fails.
    pub async fn initialize(&self, total_capital: Decimal, force: bool) -> Result<(), BudgetError> {
        let current = self.store.get(&keys::total_capital()).await?;
        if current.is_some() && !force {
            return Err(BudgetError::AlreadyInitialised);
        }

        self.store.set(&keys::total_capital(), &total_capital.to_string()).await?;
        for (strategy, fraction) in &self.allocation.strategy_fraction {
            let available = total_capital * fraction;
            self.store.set(&keys::available(strategy), &available.to_string()).await?;
            self.store.set(&keys::reserved(strategy), "0").await?;
        }
        let reserve_balance = total_capital * self.allocation.reserve_fraction;
        self.store.set(&keys::reserve(), &reserve_balance.to_string()).await?;
        info!(%total_capital, %reserve_balance, "capital ledger initialised");
        Ok(())
    }

    async fn read_decimal(&self, key: &str) -> Result<Decimal, BudgetError> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(Decimal::ZERO))
    }

    /// Reserve `amount` of `strategy`'s budget. Denial is a normal, expected
    /// outcome (spec section 7: `DenyReason` is not an error) and is logged
    /// under the `DENY:BUDGET` tag.
    ///
    /// When `strategy`'s own balance falls short, `Priority::High` and
    /// `Priority::Critical` requests may first draw the shortfall from the
    /// shared reserve buffer (`balance[reserve]`, spec section 4.5);
    /// `Priority::Critical` requests may additionally draw any remainder from
    /// other strategies' balances, bounded by `critical_cross_strategy_cap`
    /// of total capital (spec section 4.4). `Medium`/`Low` priority is
    /// confined to its own strategy's balance.
    ///
    /// Loss of the coordination store fails closed: a request is denied
    /// rather than approved when the ledger cannot be consulted.
    pub async fn request_reservation(
        &self,
        strategy: &str,
        amount: Decimal,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DenyReason> {
        if !self.allocation.strategy_fraction.contains_key(strategy) {
            return Err(DenyReason::LimitExceeded(format!("unknown strategy '{strategy}'")));
        }

        let _lock = match self
            .store
            .acquire_lock(keys::budget_lock(), self.config.budget_lock_ttl)
            .await
        {
            Ok(lock) => lock,
            Err(error) => {
                warn!(%error, tag = crate::logging::tag::DENY_BUDGET, "budget lock unavailable, denying fail-closed");
                return Err(DenyReason::InsufficientBudget);
            }
        };

        let available = match self.read_decimal(&keys::available(strategy)).await {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, tag = crate::logging::tag::DENY_BUDGET, "store read failed, denying fail-closed");
                return Err(DenyReason::InsufficientBudget);
            }
        };

        let own_amount = available.min(amount);
        let mut reserve_amount = Decimal::ZERO;
        let mut cross_strategy: Vec<(String, Decimal)> = Vec::new();
        let shortfall = amount - own_amount;

        if shortfall > Decimal::ZERO {
            match priority {
                Priority::High | Priority::Critical => {
                    let reserve_balance = self.read_decimal(&keys::reserve()).await.unwrap_or(Decimal::ZERO);
                    reserve_amount = reserve_balance.min(shortfall);
                    let remaining = shortfall - reserve_amount;

                    if remaining > Decimal::ZERO {
                        if priority == Priority::Critical {
                            match self.try_critical_draw(strategy, remaining).await {
                                Ok(draws) => cross_strategy = draws,
                                Err(reason) => {
                                    warn!(tag = crate::logging::tag::DENY_BUDGET, strategy, %amount, "critical draw denied");
                                    return Err(reason);
                                }
                            }
                        } else {
                            warn!(tag = crate::logging::tag::DENY_BUDGET, strategy, %amount, %available, "insufficient budget even with reserve");
                            return Err(DenyReason::InsufficientBudget);
                        }
                    }
                }
                Priority::Medium | Priority::Low => {
                    warn!(tag = crate::logging::tag::DENY_BUDGET, strategy, %amount, %available, "insufficient budget");
                    return Err(DenyReason::InsufficientBudget);
                }
            }
        }

        let new_available = available - own_amount;
        if let Err(error) = self.store.set(&keys::available(strategy), &new_available.to_string()).await {
            warn!(%error, tag = crate::logging::tag::DENY_BUDGET, "store write failed, denying fail-closed");
            return Err(DenyReason::InsufficientBudget);
        }
        if reserve_amount > Decimal::ZERO {
            let reserve_balance = self.read_decimal(&keys::reserve()).await.unwrap_or(Decimal::ZERO);
            let _ = self
                .store
                .set(&keys::reserve(), &(reserve_balance - reserve_amount).to_string())
                .await;
        }
        let reserved = self.read_decimal(&keys::reserved(strategy)).await.unwrap_or(Decimal::ZERO);
        let _ = self
            .store
            .set(&keys::reserved(strategy), &(reserved + amount).to_string())
            .await;

        let reservation = Reservation::with_draws(
            strategy,
            amount,
            own_amount,
            reserve_amount,
            cross_strategy,
            now,
            self.config.reservation_ttl,
        );
        self.reservations.lock().insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    /// Draw `remaining` from other strategies' balances, bounded by
    /// `critical_cross_strategy_cap` of total capital, once `strategy`'s own
    /// balance and the shared reserve are both exhausted. Must be called
    /// while holding the budget lock. Returns the per-strategy draws made.
    async fn try_critical_draw(
        &self,
        strategy: &str,
        remaining: Decimal,
    ) -> Result<Vec<(String, Decimal)>, DenyReason> {
        let total_capital = self
            .read_decimal(&keys::total_capital())
            .await
            .map_err(|_| DenyReason::InsufficientBudget)?;
        let cap = total_capital * self.config.critical_cross_strategy_cap;

        let mut pooled = Decimal::ZERO;
        let mut draws: Vec<(String, Decimal)> = Vec::new();
        for other in self.allocation.strategy_fraction.keys() {
            if other == strategy || pooled >= remaining {
                continue;
            }
            let other_available = self
                .read_decimal(&keys::available(other))
                .await
                .map_err(|_| DenyReason::InsufficientBudget)?;
            let draw = other_available.min(remaining - pooled).max(Decimal::ZERO);
            if draw > Decimal::ZERO {
                draws.push((other.clone(), draw));
                pooled += draw;
            }
        }

        if pooled < remaining || remaining > cap {
            return Err(DenyReason::InsufficientBudget);
        }

        for (other, draw) in &draws {
            let other_available = self.read_decimal(&keys::available(other)).await.unwrap_or(Decimal::ZERO);
            let _ = self
                .store
                .set(&keys::available(other), &(other_available - draw).to_string())
                .await;
        }
        Ok(draws)
    }

    /// Release a reservation: return each drawn component to the pool it came
    /// from (own balance, the shared reserve, and any strategies a `Critical`
    /// request drew from), apply `realized_pnl` (which may be negative) to
    /// the owning strategy's balance, and update its trade-ledger metric.
    /// Idempotent - releasing an unknown reservation id is a no-op, since
    /// retries and janitor sweeps may race.
    pub async fn release_reservation(
        &self,
        id: Uuid,
        realized_pnl: Decimal,
        now: DateTime<Utc>,
        rapid_loss_window: std::time::Duration,
    ) -> Result<(), BudgetError> {
        let Some(reservation) = self.reservations.lock().remove(&id) else {
            return Ok(());
        };

        let _lock = self
            .store
            .acquire_lock(keys::budget_lock(), self.config.budget_lock_ttl)
            .await?;

        let available = self.read_decimal(&keys::available(&reservation.strategy)).await?;
        let reserved = self.read_decimal(&keys::reserved(&reservation.strategy)).await?;

        let returned = available + reservation.own_amount + realized_pnl;
        self.store
            .set(&keys::available(&reservation.strategy), &returned.to_string())
            .await?;
        self.store
            .set(&keys::reserved(&reservation.strategy), &(reserved - reservation.amount).max(Decimal::ZERO).to_string())
            .await?;

        if reservation.reserve_amount > Decimal::ZERO {
            let reserve_balance = self.read_decimal(&keys::reserve()).await?;
            self.store
                .set(&keys::reserve(), &(reserve_balance + reservation.reserve_amount).to_string())
                .await?;
        }

        for (other, drawn) in &reservation.cross_strategy {
            let other_available = self.read_decimal(&keys::available(other)).await?;
            self.store
                .set(&keys::available(other), &(other_available + drawn).to_string())
                .await?;
        }

        self.metrics
            .lock()
            .entry(reservation.strategy.clone())
            .or_default()
            .record_fill(realized_pnl, now, rapid_loss_window);

        Ok(())
    }

    /// Release reservations past `expires_at` with zero realized P&L, as a
    /// last-resort recovery for agents that crashed before settling (spec
    /// section 4.4). Returns the number of reservations swept.
    pub async fn sweep_expired_reservations(
        &self,
        now: DateTime<Utc>,
        rapid_loss_window: std::time::Duration,
    ) -> Result<usize, BudgetError> {
        let expired: Vec<Uuid> = self
            .reservations
            .lock()
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();

        for id in &expired {
            self.release_reservation(*id, Decimal::ZERO, now, rapid_loss_window).await?;
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "swept expired reservations");
        }
        Ok(expired.len())
    }

    /// Issue the next nonce for `wallet`. Nonces are monotonically increasing
    /// per wallet and shared across processes via the store (spec section 4.4,
    /// property P2).
    pub async fn next_nonce(&self, wallet: &str) -> Result<u64, BudgetError> {
        let _lock = self
            .store
            .acquire_lock(&keys::nonce_lock(wallet), self.config.nonce_lock_ttl)
            .await?;
        let next = self.store.incr(&keys::nonce(wallet), 1).await?;
        Ok(next as u64)
    }

    pub fn rolling_pnl(&self, strategy: &str, now: DateTime<Utc>, window: std::time::Duration) -> Decimal {
        self.metrics
            .lock()
            .get(strategy)
            .map(|m| m.rolling_pnl(now, window))
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, BudgetError> {
        let total_capital = self.read_decimal(&keys::total_capital()).await?;
        let reserve_balance = self.read_decimal(&keys::reserve()).await?;
        let mut available_by_strategy = HashMap::new();
        let mut reserved_by_strategy = HashMap::new();
        for strategy in self.allocation.strategy_fraction.keys() {
            available_by_strategy.insert(strategy.clone(), self.read_decimal(&keys::available(strategy)).await?);
            reserved_by_strategy.insert(strategy.clone(), self.read_decimal(&keys::reserved(strategy)).await?);
        }

        Ok(LedgerSnapshot {
            total_capital,
            available_by_strategy,
            reserved_by_strategy,
            reserve_balance,
            outstanding_reservations: self.reservations.lock().values().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::InMemoryStore;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn manager() -> BudgetManager<InMemoryStore> {
        let mut strategy_fraction = HashMap::new();
        strategy_fraction.insert("arb".to_string(), dec!(0.5));
        strategy_fraction.insert("news_scalp".to_string(), dec!(0.4));
        let allocation = AllocationConfig {
            strategy_fraction,
            reserve_fraction: dec!(0.1),
        };
        let budget = BudgetConfig {
            reservation_ttl: Duration::from_secs(60),
            budget_lock_ttl: Duration::from_secs(5),
            nonce_lock_ttl: Duration::from_secs(10),
            critical_cross_strategy_cap: dec!(0.1),
        };
        BudgetManager::new(Arc::new(InMemoryStore::new()), allocation, budget)
    }

    #[tokio::test]
    async fn reservation_debits_available_and_release_returns_it() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        let now = Utc::now();

        let reservation = manager
            .request_reservation("arb", dec!(100), Priority::Medium, now)
            .await
            .unwrap();
        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(400));
        assert_eq!(snapshot.reserved_by_strategy["arb"], dec!(100));

        manager
            .release_reservation(reservation.id, dec!(10), now, Duration::from_secs(900))
            .await
            .unwrap();
        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(510));
        assert_eq!(snapshot.reserved_by_strategy["arb"], dec!(0));
    }

    #[tokio::test]
    async fn request_beyond_available_is_denied_for_non_critical() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        let err = manager
            .request_reservation("arb", dec!(600), Priority::Medium, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, DenyReason::InsufficientBudget);
    }

    #[tokio::test]
    async fn high_priority_draws_its_shortfall_from_the_reserve() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        // arb has 500 available, reserve has 100 (10% of 1000); request 550,
        // shortfall 50 is covered entirely by the reserve.
        let reservation = manager
            .request_reservation("arb", dec!(550), Priority::High, Utc::now())
            .await
            .unwrap();
        assert_eq!(reservation.amount, dec!(550));
        assert_eq!(reservation.own_amount, dec!(500));
        assert_eq!(reservation.reserve_amount, dec!(50));
        assert!(reservation.cross_strategy.is_empty());

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(0));
        assert_eq!(snapshot.reserve_balance, dec!(50));
    }

    #[tokio::test]
    async fn high_priority_is_denied_once_the_reserve_is_also_exhausted() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        // arb 500 available + reserve 100 = 600 total reachable; 700 must be denied.
        let err = manager
            .request_reservation("arb", dec!(700), Priority::High, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, DenyReason::InsufficientBudget);
    }

    #[tokio::test]
    async fn critical_priority_can_draw_from_other_strategies_once_the_reserve_is_exhausted() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        // arb has 500 available, reserve has 100; request 700, shortfall 200,
        // reserve covers 100 of it, remaining 100 <= cap (10% of 1000 = 100),
        // drawn from news_scalp.
        let reservation = manager
            .request_reservation("arb", dec!(700), Priority::Critical, Utc::now())
            .await
            .unwrap();
        assert_eq!(reservation.amount, dec!(700));
        assert_eq!(reservation.own_amount, dec!(500));
        assert_eq!(reservation.reserve_amount, dec!(100));
        assert_eq!(reservation.cross_strategy, vec![("news_scalp".to_string(), dec!(100))]);

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(0));
        assert_eq!(snapshot.reserve_balance, dec!(0));
        assert_eq!(snapshot.available_by_strategy["news_scalp"], dec!(300));
    }

    #[tokio::test]
    async fn releasing_a_reservation_returns_every_drawn_component_to_its_source() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        let now = Utc::now();

        let reservation = manager
            .request_reservation("arb", dec!(700), Priority::Critical, now)
            .await
            .unwrap();
        manager
            .release_reservation(reservation.id, dec!(5), now, Duration::from_secs(900))
            .await
            .unwrap();

        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(505));
        assert_eq!(snapshot.reserve_balance, dec!(100));
        assert_eq!(snapshot.available_by_strategy["news_scalp"], dec!(400));
        assert_eq!(snapshot.reserved_by_strategy["arb"], dec!(0));
    }

    #[tokio::test]
    async fn nonce_is_monotonically_increasing_per_wallet() {
        let manager = manager();
        assert_eq!(manager.next_nonce("wallet-a").await.unwrap(), 1);
        assert_eq!(manager.next_nonce("wallet-a").await.unwrap(), 2);
        assert_eq!(manager.next_nonce("wallet-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_releases_reservations_past_their_ttl() {
        let manager = manager();
        manager.initialize(dec!(1000), false).await.unwrap();
        let now = Utc::now() - chrono::Duration::seconds(120);
        manager.request_reservation("arb", dec!(100), Priority::Medium, now).await.unwrap();

        let swept = manager
            .sweep_expired_reservations(Utc::now(), Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let snapshot = manager.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(500));
    }
}
