//! Pure-arbitrage agent (spec section 4.7): watches its markets' order-book
//! replicas for a viable YES/NO cross, claims the opportunity it detects,
//! reserves capital for it, and places both legs as IOC orders. Like
//! [`crate::market_data::MarketDataStream`], the claim/reserve/settle
//! transitions are plain synchronous functions so they're unit-testable
//! without a live gateway; `run` is the thin async driver around them.
use crate::agents::{Agent, Heartbeat};
use crate::budget::BudgetManager;
use crate::config::ArbitrageConfig;
use crate::error::SwarmError;
use crate::gateway::orders::{OrderExecutor, OrderRequest, OrderStatus, OrderType};
use crate::gateway::GatewayError;
use crate::ledger::store::CoordinationStore;
use crate::orderbook::OrderBookReplica;
use crate::risk::{EntryRequest, RiskController};
use crate::signal::bus::SignalBus;
use crate::signal::{OpportunityKind, Priority, Side, SignalKind, SignalPayload};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    NotClaimed,
    Settled { profit_usd: Decimal },
    Aborted { reason: String },
}

/// One binary market the agent scans for a YES/NO cross, identified by the
/// token ids whose `MARKET_STATE` updates feed its local replicas (spec
/// section 4.7).
#[derive(Debug, Clone)]
pub struct WatchedMarket {
    pub market_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
}

/// A pure-arbitrage candidate computed directly from the two legs' order-book
/// replicas, before any claim race (spec section 4.7's opportunity condition).
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedOpportunity {
    pub market_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub ask_yes: Decimal,
    pub ask_no: Decimal,
    pub size: Decimal,
    pub profit_usd: Decimal,
}

impl DetectedOpportunity {
    fn into_signal_payload(self, opportunity_id: String) -> SignalPayload {
        SignalPayload::MarketOpportunity {
            opportunity_id,
            opp_kind: OpportunityKind::PureArb,
            market_ids: vec![self.market_id],
            token_ids: vec![self.yes_token_id, self.no_token_id],
            leg_prices: vec![self.ask_yes, self.ask_no],
            expected_profit_usd: self.profit_usd,
            confidence: Decimal::ONE,
            claimed_by: None,
        }
    }
}

/// Evaluate `market`'s opportunity condition against live replicas: executable
/// size `q = min(sa, sb, size_cap)`; viable iff the per-unit edge `1 - (a+b)`
/// exceeds `min_profit_per_unit + (fees(q)+gas)/q` (spec section 4.7).
pub fn evaluate_opportunity(
    market: &WatchedMarket,
    yes_book: &OrderBookReplica,
    no_book: &OrderBookReplica,
    config: &ArbitrageConfig,
) -> Option<DetectedOpportunity> {
    let ask_yes = yes_book.best_ask()?;
    let ask_no = no_book.best_ask()?;
    let size = ask_yes.size.min(ask_no.size).min(config.size_cap);
    if size <= Decimal::ZERO {
        return None;
    }

    let edge = Decimal::ONE - (ask_yes.price + ask_no.price);
    let fees = config.fee_rate * size;
    let required_edge = config.min_profit_per_unit + (fees + config.gas_usd) / size;
    if edge <= required_edge {
        return None;
    }

    Some(DetectedOpportunity {
        market_id: market.market_id.clone(),
        yes_token_id: market.yes_token_id.clone(),
        no_token_id: market.no_token_id.clone(),
        ask_yes: ask_yes.price,
        ask_no: ask_no.price,
        size,
        profit_usd: edge * size - fees - config.gas_usd,
    })
}

/// Pick which of several simultaneously viable candidates to act on first
/// (spec section 4.7 tie-breaks): higher absolute profit, then tighter market
/// (lower `a+b`), then lexicographic market id for determinism.
pub fn pick_best(candidates: &[DetectedOpportunity]) -> Option<&DetectedOpportunity> {
    candidates.iter().min_by(|x, y| {
        y.profit_usd
            .abs()
            .cmp(&x.profit_usd.abs())
            .then_with(|| (x.ask_yes + x.ask_no).cmp(&(y.ask_yes + y.ask_no)))
            .then_with(|| x.market_id.cmp(&y.market_id))
    })
}

/// True when an opportunity is still open for claiming and large enough, at
/// `size_cap` units, to clear `min_profit_per_unit` (spec section 4.7). This
/// is a sanity floor applied to any incoming `MARKET_OPPORTUNITY` signal,
/// including the agent's own, detected ones; it is not itself how viability
/// is computed, [`evaluate_opportunity`] is.
pub fn is_claimable(payload: &SignalPayload, config: &ArbitrageConfig) -> bool {
    match payload {
        SignalPayload::MarketOpportunity {
            opp_kind: OpportunityKind::PureArb,
            claimed_by: None,
            expected_profit_usd,
            ..
        } => *expected_profit_usd >= config.min_profit_per_unit * config.size_cap,
        _ => false,
    }
}

/// Transient gateway failures are worth a retry; a deliberate rejection of
/// the order is not.
fn is_transient(error: &GatewayError) -> bool {
    matches!(error, GatewayError::Timeout(_) | GatewayError::Http(_))
}

/// Exponential backoff (base 100ms, doubling, capped at 2s) plus up to 50ms of
/// jitter, in the style of the market-data reconnect loop.
fn jittered_backoff(attempt: u32) -> std::time::Duration {
    use rand::Rng;
    const BASE_MS: u64 = 100;
    const MAX_MS: u64 = 2_000;
    const JITTER_MS: u64 = 50;
    let backoff_ms = BASE_MS.saturating_mul(1u64 << attempt.min(16)).min(MAX_MS);
    let jitter_ms = rand::thread_rng().gen_range(0..=JITTER_MS);
    std::time::Duration::from_millis(backoff_ms + jitter_ms)
}

/// IOC limit price that accepts up to `max_slippage` away from `reference_price`
/// in the agent's favour-losing direction (spec section 4.7): a buy leg may
/// pay up to `reference_price * (1 + max_slippage)`, a sell leg may accept down
/// to `reference_price * (1 - max_slippage)`.
pub fn ioc_limit_price(side: Side, reference_price: Decimal, max_slippage: Decimal) -> Decimal {
    match side {
        Side::Buy => reference_price * (Decimal::ONE + max_slippage),
        Side::Sell => reference_price * (Decimal::ONE - max_slippage),
    }
}

fn claim_key(opportunity_id: &str) -> String {
    format!("arb:claim:{opportunity_id}")
}

/// Pure-arbitrage agent: buys both complementary tokens of a two-outcome
/// market pair whenever their combined ask price implies a riskless profit
/// (`asks sum < 1`) above `min_profit_per_unit` once settled.
pub struct ArbitrageAgent<S: CoordinationStore, O: OrderExecutor> {
    id: String,
    strategy: String,
    wallet_id: String,
    bus: SignalBus,
    store: Arc<S>,
    budget: Arc<BudgetManager<S>>,
    risk: Arc<RiskController>,
    orders: Arc<O>,
    config: ArbitrageConfig,
    watched_markets: Vec<WatchedMarket>,
    replicas: HashMap<String, OrderBookReplica>,
}

impl<S: CoordinationStore + 'static, O: OrderExecutor + 'static> ArbitrageAgent<S, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        wallet_id: impl Into<String>,
        bus: SignalBus,
        store: Arc<S>,
        budget: Arc<BudgetManager<S>>,
        risk: Arc<RiskController>,
        orders: Arc<O>,
        config: ArbitrageConfig,
        watched_markets: Vec<WatchedMarket>,
    ) -> Self {
        Self {
            id: id.into(),
            strategy: "arb".to_string(),
            wallet_id: wallet_id.into(),
            bus,
            store,
            budget,
            risk,
            orders,
            config,
            watched_markets,
            replicas: HashMap::new(),
        }
    }

    /// Apply a `MARKET_STATE` update to this agent's local replica for
    /// `token_id`, then return every watched market this token participates
    /// in that is now a viable opportunity (spec section 4.7).
    fn on_market_state(
        &mut self,
        token_id: &str,
        depth_bids: &[(Decimal, Decimal)],
        depth_asks: &[(Decimal, Decimal)],
    ) -> Vec<DetectedOpportunity> {
        let bids: Vec<crate::orderbook::Level> =
            depth_bids.iter().map(|&(price, size)| crate::orderbook::Level { price, size }).collect();
        let asks: Vec<crate::orderbook::Level> =
            depth_asks.iter().map(|&(price, size)| crate::orderbook::Level { price, size }).collect();

        let replica = self.replicas.entry(token_id.to_string()).or_default();
        replica.apply_snapshot(&bids, &asks);

        self.watched_markets
            .iter()
            .filter(|market| market.yes_token_id == token_id || market.no_token_id == token_id)
            .filter_map(|market| {
                let yes_book = self.replicas.get(&market.yes_token_id)?;
                let no_book = self.replicas.get(&market.no_token_id)?;
                evaluate_opportunity(market, yes_book, no_book, &self.config)
            })
            .collect()
    }

    /// Attempt to claim and execute one opportunity end to end. Returns
    /// `NotClaimed` without side effects if another agent wins the claim race
    /// or the opportunity no longer clears the profit floor.
    pub async fn attempt(&self, opportunity_id: &str, payload: &SignalPayload) -> AttemptOutcome {
        if !is_claimable(payload, &self.config) {
            return AttemptOutcome::NotClaimed;
        }
        let SignalPayload::MarketOpportunity {
            token_ids,
            leg_prices,
            expected_profit_usd,
            ..
        } = payload
        else {
            return AttemptOutcome::NotClaimed;
        };
        if token_ids.len() < 2 || leg_prices.len() < 2 {
            return AttemptOutcome::Aborted { reason: "opportunity has fewer than two legs".to_string() };
        }

        match self
            .store
            .compare_and_set(&claim_key(opportunity_id), None, &self.id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return AttemptOutcome::NotClaimed,
            Err(error) => return AttemptOutcome::Aborted { reason: format!("claim store error: {error}") },
        }
        info!(opportunity_id, agent = %self.id, "claimed arbitrage opportunity");

        let outcome = self
            .execute_claimed(opportunity_id, token_ids, leg_prices, *expected_profit_usd)
            .await;
        let _ = self.store.delete(&claim_key(opportunity_id)).await;
        outcome
    }

    async fn execute_claimed(
        &self,
        opportunity_id: &str,
        token_ids: &[String],
        leg_prices: &[Decimal],
        expected_profit_usd: Decimal,
    ) -> AttemptOutcome {
        let now = chrono::Utc::now();
        let units = self.config.size_cap;
        let cost_basis: Decimal = leg_prices.iter().sum::<Decimal>() * units;

        let entry = EntryRequest {
            agent_id: self.id.clone(),
            entity: token_ids[0].clone(),
            notional_usd: cost_basis,
            signal_quality: Decimal::ONE,
        };
        let daily_pnl = self.budget.rolling_pnl(&self.strategy, now, std::time::Duration::from_secs(24 * 3600));
        let rolling_pnl = self.budget.rolling_pnl(&self.strategy, now, std::time::Duration::from_secs(15 * 60));
        if let Err(reason) = self.risk.evaluate(&entry, daily_pnl, rolling_pnl) {
            return AttemptOutcome::Aborted { reason: reason.to_string() };
        }

        let reservation = match self
            .budget
            .request_reservation(&self.strategy, cost_basis, Priority::High, now)
            .await
        {
            Ok(r) => r,
            Err(reason) => return AttemptOutcome::Aborted { reason: reason.to_string() },
        };
        self.risk.record_entry(&entry);

        let leg_a = match self.place_leg(&token_ids[0], Side::Buy, units, leg_prices[0]).await {
            Ok(ack) => ack,
            Err(error) => {
                warn!(opportunity_id, %error, "leg A failed, releasing reservation");
                self.release(reservation.id, Decimal::ZERO, &entry, token_ids, cost_basis, now).await;
                return AttemptOutcome::Aborted { reason: format!("leg A failed: {error}") };
            }
        };

        let leg_b = match self.place_leg(&token_ids[1], Side::Buy, units, leg_prices[1]).await {
            Ok(ack) => ack,
            Err(error) => {
                error!(
                    tag = crate::logging::tag::LEG_RISK_HEDGE,
                    opportunity_id,
                    %error,
                    "leg B failed after leg A filled; unwinding leg A within the leg-risk window"
                );
                self.hedge_leg_a(&token_ids[0], units, leg_prices[0]).await;
                self.release(reservation.id, Decimal::ZERO, &entry, token_ids, cost_basis, now).await;
                return AttemptOutcome::Aborted { reason: format!("leg B failed, leg A hedged: {error}") };
            }
        };

        debug_assert!(leg_a.status_is_filled() && leg_b.status_is_filled());
        self.release(reservation.id, expected_profit_usd, &entry, token_ids, cost_basis, now).await;
        info!(opportunity_id, profit = %expected_profit_usd, "arbitrage settled");
        AttemptOutcome::Settled { profit_usd: expected_profit_usd }
    }

    /// Submit one leg, retrying transient gateway errors up to
    /// `max_gateway_retries` times with jittered backoff; a persistent or
    /// non-transient error (e.g. an outright rejection) is returned immediately
    /// (spec section 4.7).
    async fn place_leg(
        &self,
        token_id: &str,
        side: Side,
        size: Decimal,
        reference_price: Decimal,
    ) -> Result<crate::gateway::orders::OrderAck, GatewayError> {
        let mut attempt = 0u32;
        loop {
            let nonce = self
                .budget
                .next_nonce(&self.wallet_id)
                .await
                .map_err(|e| GatewayError::OrderRejected(e.to_string()))?;
            let order = OrderRequest {
                client_order_id: Uuid::new_v4().to_string(),
                token_id: token_id.to_string(),
                side,
                price: ioc_limit_price(side, reference_price, self.config.max_slippage),
                size,
                order_type: OrderType::Ioc,
                nonce,
            };
            match self.orders.submit(&order).await {
                Ok(ack) => return Ok(ack),
                Err(error) if is_transient(&error) && attempt < self.config.max_gateway_retries => {
                    let backoff = jittered_backoff(attempt);
                    warn!(
                        token_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %error,
                        "transient gateway error placing leg, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Best-effort unwind of a filled leg A when leg B could not be placed,
    /// bounded by `leg_risk_timeout` (spec section 4.7).
    async fn hedge_leg_a(&self, token_id: &str, size: Decimal, reference_price: Decimal) {
        let hedge = self.place_leg(token_id, Side::Sell, size, reference_price);
        match tokio::time::timeout(self.config.leg_risk_timeout, hedge).await {
            Ok(Ok(_)) => info!(token_id, "leg A successfully hedged"),
            Ok(Err(error)) => error!(%error, token_id, "leg A hedge failed; manual intervention required"),
            Err(_) => error!(token_id, "leg A hedge timed out; manual intervention required"),
        }
    }

    async fn release(
        &self,
        reservation_id: Uuid,
        realized_pnl: Decimal,
        entry: &EntryRequest,
        token_ids: &[String],
        notional: Decimal,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let _ = self
            .budget
            .release_reservation(reservation_id, realized_pnl, now, std::time::Duration::from_secs(15 * 60))
            .await;
        self.risk.record_exit(&entry.agent_id, &token_ids[0], notional);

        self.bus.publish(crate::signal::bus::now_signal(
            Priority::Low,
            self.id.clone(),
            Some(std::time::Duration::from_secs(60)),
            SignalPayload::PositionUpdate {
                agent: self.id.clone(),
                token_id: token_ids[0].clone(),
                side: Side::Buy,
                size: notional,
                avg_price: Decimal::ZERO,
                realized_pnl,
                unrealized_pnl: Decimal::ZERO,
            },
        ));
    }
}

trait OrderAckExt {
    fn status_is_filled(&self) -> bool;
}

impl OrderAckExt for crate::gateway::orders::OrderAck {
    fn status_is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

#[async_trait]
impl<S: CoordinationStore + 'static, O: OrderExecutor + 'static> Agent for ArbitrageAgent<S, O> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &mut self,
        heartbeat: Heartbeat,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), SwarmError> {
        let (opp_tx, mut opp_rx) = mpsc::unbounded_channel();
        let opp_handle = self.bus.subscribe(SignalKind::MarketOpportunity, self.id.clone(), move |signal| {
            let _ = opp_tx.send(signal.clone());
        });
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let state_handle = self.bus.subscribe(SignalKind::MarketState, self.id.clone(), move |signal| {
            let _ = state_tx.send(signal.clone());
        });

        loop {
            heartbeat.beat();
            tokio::select! {
                Some(signal) = opp_rx.recv() => {
                    if let SignalPayload::MarketOpportunity { opportunity_id, .. } = &signal.payload {
                        let outcome = self.attempt(opportunity_id, &signal.payload).await;
                        if let AttemptOutcome::Aborted { reason } = outcome {
                            warn!(opportunity_id, reason, "arbitrage attempt aborted");
                        }
                    }
                }
                Some(signal) = state_rx.recv() => {
                    if let SignalPayload::MarketState { token_id, depth_sample, .. } = &signal.payload {
                        let candidates = self.on_market_state(token_id, &depth_sample.bids, &depth_sample.asks);
                        if let Some(detected) = pick_best(&candidates).cloned() {
                            let opportunity_id = format!(
                                "{}:{}:{}",
                                self.id,
                                detected.market_id,
                                chrono::Utc::now().timestamp_millis()
                            );
                            let payload = detected.into_signal_payload(opportunity_id.clone());
                            let outcome = self.attempt(&opportunity_id, &payload).await;
                            if let AttemptOutcome::Aborted { reason } = outcome {
                                warn!(opportunity_id, reason, "arbitrage attempt aborted");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.bus.unsubscribe(opp_handle);
        self.bus.unsubscribe(state_handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetManager;
    use crate::config::{AllocationConfig, BudgetConfig};
    use crate::gateway::orders::OrderAck;
    use crate::ledger::store::InMemoryStore;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opportunity(profit: Decimal, claimed_by: Option<String>) -> SignalPayload {
        SignalPayload::MarketOpportunity {
            opportunity_id: "opp-1".to_string(),
            opp_kind: OpportunityKind::PureArb,
            market_ids: vec!["m1".to_string()],
            token_ids: vec!["yes".to_string(), "no".to_string()],
            leg_prices: vec![dec!(0.48), dec!(0.49)],
            expected_profit_usd: profit,
            confidence: dec!(0.9),
            claimed_by,
        }
    }

    fn arb_config() -> ArbitrageConfig {
        ArbitrageConfig {
            min_profit_per_unit: dec!(0.02),
            max_slippage: dec!(0.02),
            size_cap: dec!(50),
            fee_rate: dec!(0.001),
            gas_usd: dec!(0.05),
            leg_risk_timeout: std::time::Duration::from_secs(5),
            reserve_unused_timeout: std::time::Duration::from_secs(10),
            max_gateway_retries: 3,
        }
    }

    #[test]
    fn opportunity_below_profit_floor_is_not_claimable() {
        let config = arb_config();
        assert!(!is_claimable(&opportunity(dec!(0.5), None), &config));
        assert!(is_claimable(&opportunity(dec!(5), None), &config));
    }

    #[test]
    fn already_claimed_opportunity_is_not_claimable() {
        let config = arb_config();
        assert!(!is_claimable(&opportunity(dec!(5), Some("other-agent".to_string())), &config));
    }

    #[test]
    fn ioc_price_moves_in_the_agents_favour_losing_direction() {
        let reference = dec!(0.50);
        let slippage = dec!(0.02);
        assert_eq!(ioc_limit_price(Side::Buy, reference, slippage), dec!(0.51));
        assert_eq!(ioc_limit_price(Side::Sell, reference, slippage), dec!(0.49));
    }

    fn watched_market() -> WatchedMarket {
        WatchedMarket {
            market_id: "m1".to_string(),
            yes_token_id: "yes".to_string(),
            no_token_id: "no".to_string(),
        }
    }

    fn book_with_best_ask(price: Decimal, size: Decimal) -> OrderBookReplica {
        let mut book = OrderBookReplica::new();
        book.apply_snapshot(&[], &[crate::orderbook::Level { price, size }]);
        book
    }

    // S1: YES ask 0.48/size 100, NO ask 0.49/size 100, size_cap 50, zero
    // fees/gas. q = 50, edge = 1 - 0.97 = 0.03 clears the 0.02 floor, and the
    // resulting profit (0.03 * 50 = 1.50) matches the walkthrough exactly.
    #[test]
    fn evaluate_opportunity_detects_the_pure_arb_happy_path() {
        let mut config = arb_config();
        config.fee_rate = Decimal::ZERO;
        config.gas_usd = Decimal::ZERO;
        let market = watched_market();
        let yes_book = book_with_best_ask(dec!(0.48), dec!(100));
        let no_book = book_with_best_ask(dec!(0.49), dec!(100));

        let detected = evaluate_opportunity(&market, &yes_book, &no_book, &config).unwrap();
        assert_eq!(detected.size, dec!(50));
        assert_eq!(detected.profit_usd, dec!(1.5));
    }

    #[test]
    fn evaluate_opportunity_rejects_when_fees_and_gas_eat_the_edge() {
        let mut config = arb_config();
        config.min_profit_per_unit = dec!(0.02);
        config.fee_rate = dec!(0.005);
        config.gas_usd = dec!(0.4);
        let market = watched_market();
        // Edge is only 0.03 (same asks as S1); at q=50 the fees+gas term alone
        // is (0.005*50 + 0.4)/50 = 0.013, pushing the required edge to 0.033,
        // just above what's available.
        let yes_book = book_with_best_ask(dec!(0.48), dec!(100));
        let no_book = book_with_best_ask(dec!(0.49), dec!(100));

        assert!(evaluate_opportunity(&market, &yes_book, &no_book, &config).is_none());
    }

    #[test]
    fn evaluate_opportunity_caps_executable_size_at_size_cap_and_the_thinner_leg() {
        let mut config = arb_config();
        config.fee_rate = Decimal::ZERO;
        config.gas_usd = Decimal::ZERO;
        config.size_cap = dec!(1000);
        let market = watched_market();
        let yes_book = book_with_best_ask(dec!(0.48), dec!(20));
        let no_book = book_with_best_ask(dec!(0.49), dec!(100));

        let detected = evaluate_opportunity(&market, &yes_book, &no_book, &config).unwrap();
        assert_eq!(detected.size, dec!(20), "thinner YES leg caps the executable size");
    }

    #[test]
    fn pick_best_orders_by_profit_then_tightness_then_market_id() {
        let higher_profit = DetectedOpportunity {
            market_id: "z-market".to_string(),
            yes_token_id: "y1".to_string(),
            no_token_id: "n1".to_string(),
            ask_yes: dec!(0.40),
            ask_no: dec!(0.40),
            size: dec!(10),
            profit_usd: dec!(5),
        };
        let tighter_tie = DetectedOpportunity {
            market_id: "a-market".to_string(),
            yes_token_id: "y2".to_string(),
            no_token_id: "n2".to_string(),
            ask_yes: dec!(0.40),
            ask_no: dec!(0.45),
            size: dec!(10),
            profit_usd: dec!(1),
        };
        let wider_tie = DetectedOpportunity {
            market_id: "b-market".to_string(),
            yes_token_id: "y3".to_string(),
            no_token_id: "n3".to_string(),
            ask_yes: dec!(0.45),
            ask_no: dec!(0.45),
            size: dec!(10),
            profit_usd: dec!(1),
        };

        let best = pick_best(&[wider_tie.clone(), higher_profit.clone(), tighter_tie.clone()]).unwrap();
        assert_eq!(best, &higher_profit, "highest absolute profit wins outright");

        let best_of_tie = pick_best(&[wider_tie, tighter_tie.clone()]).unwrap();
        assert_eq!(best_of_tie, &tighter_tie, "equal profit breaks on lower a+b");
    }

    struct FakeExecutor {
        leg_b_fails: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderExecutor for FakeExecutor {
        async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, crate::gateway::GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.leg_b_fails && call == 1 {
                return Err(crate::gateway::GatewayError::OrderRejected("no liquidity".to_string()));
            }
            Ok(OrderAck {
                order_id: format!("order-{call}"),
                status: OrderStatus::Filled,
                filled_size: order.size,
                avg_fill_price: Some(order.price),
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), crate::gateway::GatewayError> {
            Ok(())
        }
    }

    fn harness(leg_b_fails: bool) -> ArbitrageAgent<InMemoryStore, FakeExecutor> {
        let mut strategy_fraction = HashMap::new();
        strategy_fraction.insert("arb".to_string(), dec!(1.0));
        let allocation = AllocationConfig { strategy_fraction, reserve_fraction: dec!(0.0) };
        let budget_config = BudgetConfig {
            reservation_ttl: std::time::Duration::from_secs(60),
            budget_lock_ttl: std::time::Duration::from_secs(5),
            nonce_lock_ttl: std::time::Duration::from_secs(5),
            critical_cross_strategy_cap: dec!(0.1),
        };
        let store = Arc::new(InMemoryStore::new());
        let budget = Arc::new(BudgetManager::new(store.clone(), allocation, budget_config));
        let bus = SignalBus::new(50, std::time::Duration::from_millis(50));
        let risk = Arc::new(RiskController::new(
            crate::config::RiskLimits {
                max_position_size_usd: dec!(1000),
                max_total_exposure_usd: dec!(10000),
                max_entity_exposure_usd: dec!(5000),
                max_positions_per_agent: 10,
                max_daily_loss_usd: dec!(1000),
                min_signal_quality: dec!(0.0),
                rapid_loss_window: std::time::Duration::from_secs(900),
                rapid_loss_fraction: dec!(0.5),
            },
            bus.clone(),
        ));
        ArbitrageAgent::new(
            "arb-1",
            "wallet-1",
            bus,
            store,
            budget,
            risk,
            Arc::new(FakeExecutor { leg_b_fails, calls: AtomicUsize::new(0) }),
            arb_config(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn happy_path_settles_both_legs() {
        let agent = harness(false);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        let outcome = agent.attempt("opp-1", &opportunity(dec!(5), None)).await;
        assert_eq!(outcome, AttemptOutcome::Settled { profit_usd: dec!(5) });
    }

    #[tokio::test]
    async fn settlement_publishes_a_position_update_with_the_realized_pnl() {
        let agent = harness(false);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        agent.attempt("opp-1", &opportunity(dec!(1.5), None)).await;

        let updates = agent.bus.recent(SignalKind::PositionUpdate, std::time::Duration::from_secs(60));
        assert_eq!(updates.len(), 1);
        assert!(matches!(
            &updates[0].payload,
            SignalPayload::PositionUpdate { realized_pnl, .. } if *realized_pnl == dec!(1.5)
        ));
    }

    #[tokio::test]
    async fn leg_b_failure_triggers_hedge_and_abort() {
        let agent = harness(true);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        let outcome = agent.attempt("opp-1", &opportunity(dec!(5), None)).await;
        assert!(matches!(outcome, AttemptOutcome::Aborted { .. }));
        // Capital should have been returned: reservation released with zero pnl.
        let snapshot = agent.budget.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(10000));
    }

    #[tokio::test]
    async fn second_claim_of_an_already_claimed_opportunity_is_a_no_op() {
        let agent = harness(false);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        agent.store.set(&claim_key("opp-1"), "other-agent").await.unwrap();
        let outcome = agent.attempt("opp-1", &opportunity(dec!(5), None)).await;
        assert_eq!(outcome, AttemptOutcome::NotClaimed);
    }

    /// Times out the first `fail_count` submissions, then fills.
    struct FlakyExecutor {
        fail_count: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderExecutor for FlakyExecutor {
        async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, crate::gateway::GatewayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_count {
                return Err(crate::gateway::GatewayError::Timeout(std::time::Duration::from_secs(1)));
            }
            Ok(OrderAck {
                order_id: format!("order-{call}"),
                status: OrderStatus::Filled,
                filled_size: order.size,
                avg_fill_price: Some(order.price),
            })
        }

        async fn cancel(&self, _order_id: &str) -> Result<(), crate::gateway::GatewayError> {
            Ok(())
        }
    }

    fn harness_with_flaky_executor(fail_count: usize) -> ArbitrageAgent<InMemoryStore, FlakyExecutor> {
        let mut strategy_fraction = HashMap::new();
        strategy_fraction.insert("arb".to_string(), dec!(1.0));
        let allocation = AllocationConfig { strategy_fraction, reserve_fraction: dec!(0.0) };
        let budget_config = BudgetConfig {
            reservation_ttl: std::time::Duration::from_secs(60),
            budget_lock_ttl: std::time::Duration::from_secs(5),
            nonce_lock_ttl: std::time::Duration::from_secs(5),
            critical_cross_strategy_cap: dec!(0.1),
        };
        let store = Arc::new(InMemoryStore::new());
        let budget = Arc::new(BudgetManager::new(store.clone(), allocation, budget_config));
        let bus = SignalBus::new(50, std::time::Duration::from_millis(50));
        let risk = Arc::new(RiskController::new(
            crate::config::RiskLimits {
                max_position_size_usd: dec!(1000),
                max_total_exposure_usd: dec!(10000),
                max_entity_exposure_usd: dec!(5000),
                max_positions_per_agent: 10,
                max_daily_loss_usd: dec!(1000),
                min_signal_quality: dec!(0.0),
                rapid_loss_window: std::time::Duration::from_secs(900),
                rapid_loss_fraction: dec!(0.5),
            },
            bus.clone(),
        ));
        ArbitrageAgent::new(
            "arb-1",
            "wallet-1",
            bus,
            store,
            budget,
            risk,
            Arc::new(FlakyExecutor { fail_count, calls: AtomicUsize::new(0) }),
            arb_config(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn transient_gateway_errors_are_retried_until_they_succeed() {
        let agent = harness_with_flaky_executor(2);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        let outcome = agent.attempt("opp-1", &opportunity(dec!(5), None)).await;
        assert_eq!(outcome, AttemptOutcome::Settled { profit_usd: dec!(5) });
    }

    #[tokio::test]
    async fn transient_gateway_errors_abort_once_retries_are_exhausted() {
        // max_gateway_retries is 3, so 4 consecutive timeouts exhaust it.
        let agent = harness_with_flaky_executor(4);
        agent.budget.initialize(dec!(10000), false).await.unwrap();
        let outcome = agent.attempt("opp-1", &opportunity(dec!(5), None)).await;
        assert!(matches!(outcome, AttemptOutcome::Aborted { .. }));
        let snapshot = agent.budget.snapshot().await.unwrap();
        assert_eq!(snapshot.available_by_strategy["arb"], dec!(10000));
    }
}
