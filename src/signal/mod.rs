//! The signal data model (spec section 3 "Signal" and section 4.1 signal kinds).
//!
//! A [`Signal`] is an immutable record carrying one datum from a producing agent
//! to zero or more consuming agents. It is never mutated after construction.
pub mod bus;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Closed set of signal kinds. Mirrors [`SignalPayload`]'s variants one-to-one;
/// kept as its own enum so the bus can index history/subscriptions by kind
/// without requiring a payload instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    GlobalSentiment,
    HotToken,
    WhaleMove,
    NewsEvent,
    MarketOpportunity,
    RiskAlert,
    PositionUpdate,
    MarketState,
}

impl SignalKind {
    pub const ALL: [SignalKind; 8] = [
        SignalKind::GlobalSentiment,
        SignalKind::HotToken,
        SignalKind::WhaleMove,
        SignalKind::NewsEvent,
        SignalKind::MarketOpportunity,
        SignalKind::RiskAlert,
        SignalKind::PositionUpdate,
        SignalKind::MarketState,
    ];
}

/// Priority ordering from spec section 3. Values are the numeric weights the
/// spec assigns them, used directly for tie-breaking and back-pressure
/// decisions (HIGH/CRITICAL are never dropped under back-pressure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low = 25,
    Medium = 50,
    High = 75,
    Critical = 100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotTokenReason {
    WhaleBuy,
    NewsSpike,
    StatArb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityKind {
    PureArb,
    StatArb,
    NewsArb,
}

/// Aggregated liquidity sample used in `MARKET_STATE` signals for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSample {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Typed payload for each signal kind, per spec section 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalPayload {
    GlobalSentiment {
        score: Decimal,
        confidence: Decimal,
        dominant_topic: String,
        top_entities: Vec<String>,
        news_count_last_hour: u32,
    },
    HotToken {
        token_id: String,
        market_id: String,
        market_name: String,
        volume_1h: Decimal,
        velocity_per_min: Decimal,
        volatility: Decimal,
        reason: HotTokenReason,
    },
    WhaleMove {
        wallet_id: String,
        wallet_label: Option<String>,
        market_id: String,
        token_id: String,
        side: Side,
        usd_amount: Decimal,
        price: Decimal,
        entity: String,
    },
    NewsEvent {
        headline: String,
        entities: Vec<String>,
        sentiment: Decimal,
        confidence: Decimal,
        impact: Impact,
        source: String,
        related_markets: Vec<String>,
    },
    MarketOpportunity {
        opportunity_id: String,
        opp_kind: OpportunityKind,
        market_ids: Vec<String>,
        token_ids: Vec<String>,
        /// Reference price observed for each entry in `token_ids`, in the
        /// same order, used to build the IOC limit for that leg.
        leg_prices: Vec<Decimal>,
        expected_profit_usd: Decimal,
        confidence: Decimal,
        claimed_by: Option<String>,
    },
    RiskAlert {
        severity: Priority,
        scope: RiskScope,
        reason: String,
    },
    PositionUpdate {
        agent: String,
        token_id: String,
        side: Side,
        size: Decimal,
        avg_price: Decimal,
        realized_pnl: Decimal,
        unrealized_pnl: Decimal,
    },
    MarketState {
        token_id: String,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        mid: Option<Decimal>,
        depth_sample: DepthSample,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskScope {
    Agent,
    Portfolio,
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::GlobalSentiment { .. } => SignalKind::GlobalSentiment,
            SignalPayload::HotToken { .. } => SignalKind::HotToken,
            SignalPayload::WhaleMove { .. } => SignalKind::WhaleMove,
            SignalPayload::NewsEvent { .. } => SignalKind::NewsEvent,
            SignalPayload::MarketOpportunity { .. } => SignalKind::MarketOpportunity,
            SignalPayload::RiskAlert { .. } => SignalKind::RiskAlert,
            SignalPayload::PositionUpdate { .. } => SignalKind::PositionUpdate,
            SignalPayload::MarketState { .. } => SignalKind::MarketState,
        }
    }
}

/// Immutable record carrying one datum from a producing agent to zero or more
/// consuming agents (spec section 3). Constructed once via [`Signal::new`] and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub priority: Priority,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn new(
        priority: Priority,
        source: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            priority,
            source: source.into(),
            created_at,
            ttl,
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// True when `now - created_at > ttl`. A signal with no TTL never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let age = now.signed_duration_since(self.created_at);
                match chrono::Duration::from_std(ttl) {
                    Ok(ttl) => age > ttl,
                    Err(_) => false,
                }
            }
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}
