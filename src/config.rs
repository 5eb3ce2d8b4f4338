//! Top-level configuration, in the shape of the teacher's `system::config::SystemConfig`:
//! one aggregate struct, deserialised from a file, validated on load rather than trusted
//! blindly.
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("allocation fractions {sum} + reserve_fraction {reserve} must equal 1 exactly")]
    AllocationDoesNotSumToOne { sum: String, reserve: String },

    #[error("strategy '{0}' has no allocation configured")]
    MissingAllocation(String),

    #[error("`--budget` supplied without `--reset` on a ledger that is already initialised")]
    BudgetWithoutReset,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full swarm configuration. Loaded from a config file and overlaid with CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub allocation: AllocationConfig,
    pub risk: RiskLimits,
    pub budget: BudgetConfig,
    pub signal_bus: SignalBusConfig,
    pub supervisor: SupervisorConfig,
    pub arbitrage: ArbitrageConfig,
    pub gateways: GatewayConfig,
}

impl SwarmConfig {
    /// Validate cross-field invariants that cannot be expressed via serde alone.
    ///
    /// Per the spec's open question: the allocation fractions MUST sum to
    /// `1 - reserve_fraction` exactly. Implementations must reject a violating
    /// configuration rather than renormalize it silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.allocation.validate()
    }
}

/// Per-strategy capital allocation fractions, configuration only (never derived).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Fraction of total_capital per strategy. Must sum with `reserve_fraction` to 1.
    pub strategy_fraction: HashMap<String, Decimal>,
    pub reserve_fraction: Decimal,
}

impl AllocationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum: Decimal = self.strategy_fraction.values().copied().sum::<Decimal>()
            + self.reserve_fraction;

        if sum != Decimal::ONE {
            return Err(ConfigError::AllocationDoesNotSumToOne {
                sum: sum.to_string(),
                reserve: self.reserve_fraction.to_string(),
            });
        }

        Ok(())
    }

    pub fn fraction_for(&self, strategy: &str) -> Result<Decimal, ConfigError> {
        self.strategy_fraction
            .get(strategy)
            .copied()
            .ok_or_else(|| ConfigError::MissingAllocation(strategy.to_string()))
    }
}

/// Portfolio-wide risk limits consumed by the `RiskController` (spec section 4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size_usd: Decimal,
    pub max_total_exposure_usd: Decimal,
    pub max_entity_exposure_usd: Decimal,
    pub max_positions_per_agent: usize,
    pub max_daily_loss_usd: Decimal,
    pub min_signal_quality: Decimal,
    /// Width of the rapid-loss detection window (default 15 minutes).
    #[serde(with = "humantime_secs")]
    pub rapid_loss_window: Duration,
    /// Fraction of `max_daily_loss_usd` that, if lost inside `rapid_loss_window`,
    /// trips the circuit breaker early (default 0.5).
    pub rapid_loss_fraction: Decimal,
}

/// Budget manager tunables (spec section 4.4/4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(with = "humantime_secs")]
    pub reservation_ttl: Duration,
    #[serde(with = "humantime_secs")]
    pub budget_lock_ttl: Duration,
    #[serde(with = "humantime_secs")]
    pub nonce_lock_ttl: Duration,
    /// Cap, as a fraction of total capital, that a `critical` priority request
    /// may additionally draw from strategies other than its own.
    pub critical_cross_strategy_cap: Decimal,
}

/// SignalBus tunables (spec section 4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalBusConfig {
    pub history_capacity: usize,
    #[serde(with = "humantime_millis")]
    pub subscriber_budget: Duration,
}

/// AgentSupervisor tunables (spec section 4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(with = "humantime_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_secs")]
    pub restart_backoff_base: Duration,
    #[serde(with = "humantime_secs")]
    pub restart_backoff_max: Duration,
    pub max_restarts_per_window: usize,
    #[serde(with = "humantime_secs")]
    pub restart_window: Duration,
    #[serde(with = "humantime_secs")]
    pub shutdown_grace_period: Duration,
}

/// ArbitrageAgent tunables (spec section 4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    pub min_profit_per_unit: Decimal,
    pub max_slippage: Decimal,
    pub size_cap: Decimal,
    /// Trading fee charged per unit executed, as a fraction of notional.
    pub fee_rate: Decimal,
    /// Fixed on-chain settlement cost per opportunity, in USD.
    pub gas_usd: Decimal,
    #[serde(with = "humantime_secs")]
    pub leg_risk_timeout: Duration,
    #[serde(with = "humantime_secs")]
    pub reserve_unused_timeout: Duration,
    /// Bounded retries with jittered backoff for transient gateway errors
    /// while placing a leg (spec section 4.7).
    pub max_gateway_retries: u32,
}

/// Gateway endpoints (spec section 6.1-6.3); secrets come from the environment,
/// never from this struct (spec section 6.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub catalog_url: String,
    pub order_gateway_url: String,
    pub market_data_ws_url: String,
    #[serde(with = "humantime_secs")]
    pub order_timeout: Duration,
    #[serde(with = "humantime_secs")]
    pub catalog_timeout: Duration,
    #[serde(with = "humantime_secs")]
    pub store_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        let mut strategy_fraction = HashMap::new();
        strategy_fraction.insert("news_scalp".to_string(), Decimal::new(40, 2));
        strategy_fraction.insert("arb".to_string(), Decimal::new(35, 2));
        strategy_fraction.insert("stat_arb".to_string(), Decimal::new(25, 2));

        Self {
            allocation: AllocationConfig {
                strategy_fraction,
                reserve_fraction: Decimal::new(10, 2),
            },
            risk: RiskLimits {
                max_position_size_usd: Decimal::new(500000, 2),
                max_total_exposure_usd: Decimal::new(5000000, 2),
                max_entity_exposure_usd: Decimal::new(1500000, 2),
                max_positions_per_agent: 10,
                max_daily_loss_usd: Decimal::new(10000, 2),
                min_signal_quality: Decimal::new(30, 2),
                rapid_loss_window: Duration::from_secs(15 * 60),
                rapid_loss_fraction: Decimal::new(50, 2),
            },
            budget: BudgetConfig {
                reservation_ttl: Duration::from_secs(60),
                budget_lock_ttl: Duration::from_secs(5),
                nonce_lock_ttl: Duration::from_secs(10),
                critical_cross_strategy_cap: Decimal::new(10, 2),
            },
            signal_bus: SignalBusConfig {
                history_capacity: 100,
                subscriber_budget: Duration::from_millis(50),
            },
            supervisor: SupervisorConfig {
                heartbeat_interval: Duration::from_secs(10),
                restart_backoff_base: Duration::from_secs(5),
                restart_backoff_max: Duration::from_secs(60),
                max_restarts_per_window: 5,
                restart_window: Duration::from_secs(15 * 60),
                shutdown_grace_period: Duration::from_secs(30),
            },
            arbitrage: ArbitrageConfig {
                min_profit_per_unit: Decimal::new(2, 2),
                max_slippage: Decimal::new(2, 2),
                size_cap: Decimal::new(50, 0),
                fee_rate: Decimal::new(1, 3),
                gas_usd: Decimal::new(5, 2),
                leg_risk_timeout: Duration::from_secs(5),
                reserve_unused_timeout: Duration::from_secs(10),
                max_gateway_retries: 3,
            },
            gateways: GatewayConfig {
                catalog_url: "https://catalog.invalid/markets".to_string(),
                order_gateway_url: "https://orders.invalid".to_string(),
                market_data_ws_url: "wss://feed.invalid/ws".to_string(),
                order_timeout: Duration::from_secs(3),
                catalog_timeout: Duration::from_secs(5),
                store_timeout: Duration::from_secs(1),
            },
        }
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
