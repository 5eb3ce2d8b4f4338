//! Property-style checks on the shared capital ledger (spec section 4.4/4.5,
//! properties P1/P2): budget conservation under concurrent reserve/release
//! pairs, and nonce monotonicity under concurrent callers.
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::budget::BudgetManager;
use swarm_core::config::{AllocationConfig, BudgetConfig};
use swarm_core::ledger::store::InMemoryStore;
use swarm_core::signal::Priority;

fn allocation() -> AllocationConfig {
    let mut strategy_fraction = HashMap::new();
    strategy_fraction.insert("arb".to_string(), dec!(0.5));
    strategy_fraction.insert("news_scalp".to_string(), dec!(0.4));
    AllocationConfig { strategy_fraction, reserve_fraction: dec!(0.1) }
}

fn budget_config() -> BudgetConfig {
    BudgetConfig {
        reservation_ttl: Duration::from_secs(60),
        budget_lock_ttl: Duration::from_secs(5),
        nonce_lock_ttl: Duration::from_secs(5),
        critical_cross_strategy_cap: dec!(0.1),
    }
}

/// P1: at every observable checkpoint, `sum(available) + sum(reserved) +
/// reserve_balance == total_capital` (modulo realized pnl from settled
/// reservations), run across many concurrent reservation/release pairs.
#[tokio::test]
async fn budget_conservation_holds_across_concurrent_reservations() {
    let store = Arc::new(InMemoryStore::new());
    let manager = Arc::new(BudgetManager::new(store, allocation(), budget_config()));
    manager.initialize(dec!(10000), false).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..40 {
        let manager = manager.clone();
        let strategy = if i % 2 == 0 { "arb" } else { "news_scalp" };
        handles.push(tokio::spawn(async move {
            let now = Utc::now();
            if let Ok(reservation) = manager.request_reservation(strategy, dec!(10), Priority::Medium, now).await {
                manager.release_reservation(reservation.id, dec!(1), now, Duration::from_secs(900)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = manager.snapshot().await.unwrap();
    let sum_available: Decimal = snapshot.available_by_strategy.values().copied().sum();
    let sum_reserved: Decimal = snapshot.reserved_by_strategy.values().copied().sum();
    // Every reservation in this run settles with +1 realized pnl, so the pool
    // grows by however many reservations succeeded; conservation means no
    // capital is created or destroyed beyond the sum of realized pnl.
    let realized_total = sum_available + sum_reserved + snapshot.reserve_balance - dec!(10000);
    assert!(realized_total >= Decimal::ZERO, "no capital should vanish: {realized_total}");
    assert!(snapshot.outstanding_reservations.is_empty(), "every reservation was released");
}

/// P2: nonces for one wallet are strictly increasing even under concurrent callers.
#[tokio::test]
async fn nonce_is_strictly_increasing_under_concurrent_callers() {
    let store = Arc::new(InMemoryStore::new());
    let manager = Arc::new(BudgetManager::new(store, allocation(), budget_config()));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.next_nonce("wallet-a").await.unwrap() }));
    }

    let mut nonces: Vec<u64> = Vec::new();
    for handle in handles {
        nonces.push(handle.await.unwrap());
    }
    nonces.sort_unstable();

    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(nonces, expected, "every nonce from 1..=20 must be issued exactly once");
}
