//! Portfolio-wide risk limits and the circuit breaker (spec section 4.6).
//! Exposure and position-count bookkeeping follow the teacher's
//! `ExposureTracker`/`DrawdownTracker` shape (one `HashMap` per tracked
//! quantity, a `check_limit` that compares against a configured bound), kept
//! here as private fields on one controller rather than standalone generic
//! trackers since every quantity here is keyed by `String` (agent id or
//! entity name), never by an exchange instrument key.
use crate::config::RiskLimits;
use crate::error::DenyReason;
use crate::logging::tag;
use crate::signal::bus::{now_signal, SignalBus};
use crate::signal::{Priority, RiskScope, SignalPayload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{error, warn};

/// A proposed new position, evaluated before an agent is allowed to place it.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub agent_id: String,
    pub entity: String,
    pub notional_usd: Decimal,
    pub signal_quality: Decimal,
}

#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    tripped: bool,
    reason: Option<String>,
    tripped_at: Option<DateTime<Utc>>,
}

/// Portfolio-wide risk gate. One instance is shared (behind an `Arc`) by every
/// agent; all mutation happens under `parking_lot::Mutex`, consistent with the
/// rest of the substrate's single-task-ownership model (spec section 5) - here
/// the risk controller itself is the sole owner of its trackers, reachable
/// from multiple agent tasks only for read-mostly evaluation.
pub struct RiskController {
    limits: RiskLimits,
    bus: SignalBus,
    exposure_by_entity: Mutex<HashMap<String, Decimal>>,
    exposure_by_agent: Mutex<HashMap<String, Decimal>>,
    positions_by_agent: Mutex<HashMap<String, usize>>,
    total_exposure: Mutex<Decimal>,
    breaker: Mutex<CircuitBreakerState>,
}

impl RiskController {
    /// `bus` receives the single `RISK_ALERT {severity=CRITICAL}` published
    /// when the breaker trips (spec section 4.6, property P8).
    pub fn new(limits: RiskLimits, bus: SignalBus) -> Self {
        Self {
            limits,
            bus,
            exposure_by_entity: Mutex::new(HashMap::new()),
            exposure_by_agent: Mutex::new(HashMap::new()),
            positions_by_agent: Mutex::new(HashMap::new()),
            total_exposure: Mutex::new(Decimal::ZERO),
            breaker: Mutex::new(CircuitBreakerState::default()),
        }
    }

    /// Evaluate a proposed entry against every limit in spec section 4.6, the
    /// circuit breaker, and the rapid-loss rule. `daily_realized_pnl` and
    /// `rolling_pnl` are supplied by the caller (sourced from
    /// [`crate::budget::BudgetManager`]) so this controller stays independent
    /// of the ledger's generic store parameter.
    ///
    /// Crossing `max_daily_loss_usd` or the rapid-loss threshold trips the
    /// breaker as a side effect of this call; once tripped it stays tripped
    /// until [`RiskController::reset`] is called, which is only ever invoked
    /// by an operator (spec section 4.6: "manual reset only").
    pub fn evaluate(
        &self,
        request: &EntryRequest,
        daily_realized_pnl: Decimal,
        rolling_pnl: Decimal,
    ) -> Result<(), DenyReason> {
        if self.is_tripped() {
            return Err(DenyReason::CircuitBreakerTripped);
        }

        if request.signal_quality < self.limits.min_signal_quality {
            warn!(tag = tag::DENY_RISK, quality = %request.signal_quality, "signal quality below floor");
            return Err(DenyReason::LowSignalQuality);
        }

        if request.notional_usd > self.limits.max_position_size_usd {
            warn!(tag = tag::DENY_RISK, limit = "max_position_size_usd", "position size limit exceeded");
            return Err(DenyReason::LimitExceeded("max_position_size_usd".to_string()));
        }

        let prospective_total = *self.total_exposure.lock() + request.notional_usd;
        if prospective_total > self.limits.max_total_exposure_usd {
            warn!(tag = tag::DENY_RISK, limit = "max_total_exposure_usd", "total exposure limit exceeded");
            return Err(DenyReason::LimitExceeded("max_total_exposure_usd".to_string()));
        }

        let entity_exposure = *self
            .exposure_by_entity
            .lock()
            .get(&request.entity)
            .unwrap_or(&Decimal::ZERO);
        if entity_exposure + request.notional_usd > self.limits.max_entity_exposure_usd {
            warn!(tag = tag::DENY_RISK, limit = "max_entity_exposure_usd", entity = %request.entity, "entity exposure limit exceeded");
            return Err(DenyReason::LimitExceeded("max_entity_exposure_usd".to_string()));
        }

        let positions = *self
            .positions_by_agent
            .lock()
            .get(&request.agent_id)
            .unwrap_or(&0);
        if positions >= self.limits.max_positions_per_agent {
            warn!(tag = tag::DENY_RISK, limit = "max_positions_per_agent", agent = %request.agent_id, "position count limit exceeded");
            return Err(DenyReason::LimitExceeded("max_positions_per_agent".to_string()));
        }

        if daily_realized_pnl <= -self.limits.max_daily_loss_usd {
            self.trip("daily loss limit breached".to_string());
            return Err(DenyReason::CircuitBreakerTripped);
        }

        let rapid_loss_threshold = self.limits.max_daily_loss_usd * self.limits.rapid_loss_fraction;
        if rolling_pnl <= -rapid_loss_threshold {
            self.trip("rapid loss threshold breached within the rolling window".to_string());
            return Err(DenyReason::CircuitBreakerTripped);
        }

        Ok(())
    }

    /// Record a just-approved entry's exposure and position count.
    pub fn record_entry(&self, request: &EntryRequest) {
        *self.total_exposure.lock() += request.notional_usd;
        *self
            .exposure_by_entity
            .lock()
            .entry(request.entity.clone())
            .or_insert(Decimal::ZERO) += request.notional_usd;
        *self
            .exposure_by_agent
            .lock()
            .entry(request.agent_id.clone())
            .or_insert(Decimal::ZERO) += request.notional_usd;
        *self
            .positions_by_agent
            .lock()
            .entry(request.agent_id.clone())
            .or_insert(0) += 1;
    }

    /// Record a closed position's exposure leaving the book.
    pub fn record_exit(&self, agent_id: &str, entity: &str, notional_usd: Decimal) {
        let mut total = self.total_exposure.lock();
        *total = (*total - notional_usd).max(Decimal::ZERO);
        drop(total);

        if let Some(exposure) = self.exposure_by_entity.lock().get_mut(entity) {
            *exposure = (*exposure - notional_usd).max(Decimal::ZERO);
        }
        if let Some(exposure) = self.exposure_by_agent.lock().get_mut(agent_id) {
            *exposure = (*exposure - notional_usd).max(Decimal::ZERO);
        }
        if let Some(count) = self.positions_by_agent.lock().get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn trip(&self, reason: String) {
        let mut breaker = self.breaker.lock();
        if !breaker.tripped {
            error!(tag = tag::CB_TRIPPED, %reason, "circuit breaker tripped");
            self.bus.publish(now_signal(
                Priority::Critical,
                "risk_controller",
                None,
                SignalPayload::RiskAlert {
                    severity: Priority::Critical,
                    scope: RiskScope::Portfolio,
                    reason: reason.clone(),
                },
            ));
        }
        breaker.tripped = true;
        breaker.reason = Some(reason);
        breaker.tripped_at = Some(Utc::now());
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.lock().tripped
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.breaker.lock().reason.clone()
    }

    /// Manually clear the circuit breaker. Only ever called from operator
    /// tooling (spec section 4.6/6.5), never automatically.
    pub fn reset(&self) {
        *self.breaker.lock() = CircuitBreakerState::default();
        warn!("circuit breaker manually reset by operator");
    }
}
