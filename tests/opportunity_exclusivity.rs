//! Property P3 (spec section 4.7): for any `opportunity_id`, at most one
//! agent observes claim success when several race for it concurrently.
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::agents::arbitrage::{ArbitrageAgent, AttemptOutcome};
use swarm_core::budget::BudgetManager;
use swarm_core::config::{AllocationConfig, ArbitrageConfig, BudgetConfig, RiskLimits};
use swarm_core::gateway::orders::{OrderAck, OrderExecutor, OrderRequest, OrderStatus};
use swarm_core::gateway::GatewayError;
use swarm_core::ledger::store::InMemoryStore;
use swarm_core::risk::RiskController;
use swarm_core::signal::bus::SignalBus;
use swarm_core::signal::{OpportunityKind, SignalPayload};

struct AlwaysFillsExecutor;

#[async_trait]
impl OrderExecutor for AlwaysFillsExecutor {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        Ok(OrderAck {
            order_id: "order".to_string(),
            status: OrderStatus::Filled,
            filled_size: order.size,
            avg_fill_price: Some(order.price),
        })
    }

    async fn cancel(&self, _order_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn arb_config() -> ArbitrageConfig {
    ArbitrageConfig {
        min_profit_per_unit: dec!(0.02),
        max_slippage: dec!(0.02),
        size_cap: dec!(10),
        fee_rate: dec!(0.001),
        gas_usd: dec!(0.05),
        leg_risk_timeout: Duration::from_secs(5),
        reserve_unused_timeout: Duration::from_secs(10),
        max_gateway_retries: 3,
    }
}

fn risk_limits() -> RiskLimits {
    RiskLimits {
        max_position_size_usd: dec!(100000),
        max_total_exposure_usd: dec!(1000000),
        max_entity_exposure_usd: dec!(500000),
        max_positions_per_agent: 1000,
        max_daily_loss_usd: dec!(100000),
        min_signal_quality: dec!(0.0),
        rapid_loss_window: Duration::from_secs(900),
        rapid_loss_fraction: dec!(0.5),
    }
}

fn opportunity() -> SignalPayload {
    SignalPayload::MarketOpportunity {
        opportunity_id: "opp-race".to_string(),
        opp_kind: OpportunityKind::PureArb,
        market_ids: vec!["m1".to_string()],
        token_ids: vec!["yes".to_string(), "no".to_string()],
        leg_prices: vec![dec!(0.48), dec!(0.49)],
        expected_profit_usd: dec!(5),
        confidence: dec!(0.9),
        claimed_by: None,
    }
}

// Runs on a real multi-worker runtime, with every claimant released off a
// shared barrier at once, so the 8 `attempt` calls genuinely overlap on
// separate OS threads instead of the current-thread scheduler running each
// one to completion (claim through release) before the next is polled.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn only_one_concurrent_claimant_settles_the_same_opportunity() {
    let mut strategy_fraction = HashMap::new();
    strategy_fraction.insert("arb".to_string(), dec!(1.0));
    let allocation = AllocationConfig { strategy_fraction, reserve_fraction: dec!(0.0) };
    let budget_config = BudgetConfig {
        reservation_ttl: Duration::from_secs(60),
        budget_lock_ttl: Duration::from_secs(5),
        nonce_lock_ttl: Duration::from_secs(5),
        critical_cross_strategy_cap: dec!(0.1),
    };

    let store = Arc::new(InMemoryStore::new());
    let budget = Arc::new(BudgetManager::new(store.clone(), allocation, budget_config));
    budget.initialize(dec!(100000), false).await.unwrap();
    let bus = SignalBus::new(50, Duration::from_millis(50));
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let mut handles = Vec::new();
    for i in 0..8 {
        let risk = Arc::new(RiskController::new(risk_limits(), bus.clone()));
        let agent = Arc::new(ArbitrageAgent::new(
            format!("arb-{i}"),
            format!("wallet-{i}"),
            bus.clone(),
            store.clone(),
            budget.clone(),
            risk,
            Arc::new(AlwaysFillsExecutor),
            arb_config(),
            Vec::new(),
        ));
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            agent.attempt("opp-race", &opportunity()).await
        }));
    }

    let mut settled = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), AttemptOutcome::Settled { .. }) {
            settled += 1;
        }
    }

    assert_eq!(settled, 1, "exactly one agent should have won the claim race and settled");
}
