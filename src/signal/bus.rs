//! Low-latency fan-out of [`Signal`]s to subscribers, with TTL, bounded
//! history, priority-aware delivery, and derived aggregates (spec section 4.1).
//!
//! The bus is owned by one logical task (spec section 5: "bus state is
//! accessed only from the event-loop task"); `parking_lot::Mutex` guards it so
//! that handles can be cloned freely across the Tokio tasks that *call into*
//! the bus without ever holding the lock across an `.await`.
use crate::signal::{Impact, Priority, Side, Signal, SignalKind, SignalPayload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Opaque handle returned by [`SignalBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Callback = Box<dyn Fn(&Signal) + Send + Sync>;

struct Subscriber {
    handle: SubscriptionHandle,
    agent_id: String,
    callback: Callback,
    /// True if the subscriber's previous call exceeded the soft budget; used
    /// by the back-pressure policy to decide whether LOW priority signals are
    /// still delivered to it.
    flagged_slow: bool,
}

#[derive(Default)]
struct KindState {
    history: VecDeque<Signal>,
    subscribers: Vec<Subscriber>,
    error_count: u64,
    slow_callback_count: u64,
}

struct Inner {
    state: HashMap<SignalKind, KindState>,
    history_capacity: usize,
    subscriber_budget: Duration,
}

impl Inner {
    fn kind_state(&mut self, kind: SignalKind) -> &mut KindState {
        self.state.entry(kind).or_default()
    }
}

/// In-process pub/sub bus for [`Signal`]s (spec section 4.1).
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<Mutex<Inner>>,
    next_handle: Arc<AtomicU64>,
}

impl SignalBus {
    pub fn new(history_capacity: usize, subscriber_budget: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: HashMap::new(),
                history_capacity,
                subscriber_budget,
            })),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Append `signal` to its per-kind history ring buffer (evicting the
    /// oldest entry when full), then fan it out to current subscribers of
    /// that kind in registration order. Never waits for subscribers.
    pub fn publish(&self, signal: Signal) {
        let kind = signal.kind();
        let mut inner = self.inner.lock();
        let capacity = inner.history_capacity;
        let budget = inner.subscriber_budget;
        let state = inner.kind_state(kind);

        if state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(signal.clone());

        for subscriber in state.subscribers.iter_mut() {
            // Back-pressure: once a subscriber has been flagged slow, LOW
            // priority signals are dropped from *delivery* to it (never from
            // history). HIGH and CRITICAL are never dropped.
            if subscriber.flagged_slow && signal.priority == Priority::Low {
                continue;
            }

            let started = Instant::now();
            let callback = &subscriber.callback;
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&signal)));
            let elapsed = started.elapsed();

            if result.is_err() {
                state.error_count += 1;
                error!(
                    agent_id = %subscriber.agent_id,
                    kind = ?kind,
                    "subscriber callback panicked; isolating and continuing delivery"
                );
            }

            subscriber.flagged_slow = elapsed > budget;
            if subscriber.flagged_slow {
                state.slow_callback_count += 1;
                warn!(
                    agent_id = %subscriber.agent_id,
                    kind = ?kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    "subscriber callback exceeded soft budget"
                );
            }
        }
    }

    /// Register `callback` for future publications of `kind`. A late
    /// subscriber does not see history; it must call [`SignalBus::recent`].
    pub fn subscribe(
        &self,
        kind: SignalKind,
        agent_id: impl Into<String>,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock();
        inner.kind_state(kind).subscribers.push(Subscriber {
            handle,
            agent_id: agent_id.into(),
            callback: Box::new(callback),
            flagged_slow: false,
        });
        handle
    }

    /// Idempotent: unsubscribing an already-removed or unknown handle is a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock();
        for state in inner.state.values_mut() {
            state.subscribers.retain(|s| s.handle != handle);
        }
    }

    /// Unexpired subset of `kind`'s history whose age is within `window`.
    pub fn recent(&self, kind: SignalKind, window: Duration) -> Vec<Signal> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let inner = self.inner.lock();
        inner
            .state
            .get(&kind)
            .map(|state| {
                state
                    .history
                    .iter()
                    .filter(|s| !s.is_expired(now) && s.age(now) <= window)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriber_error_count(&self, kind: SignalKind) -> u64 {
        self.inner
            .lock()
            .state
            .get(&kind)
            .map(|s| s.error_count)
            .unwrap_or(0)
    }

    pub fn slow_callback_count(&self, kind: SignalKind) -> u64 {
        self.inner
            .lock()
            .state
            .get(&kind)
            .map(|s| s.slow_callback_count)
            .unwrap_or(0)
    }

    /// Most recent unexpired `GLOBAL_SENTIMENT` signal, if any.
    pub fn get_global_sentiment(&self) -> Option<Signal> {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .state
            .get(&SignalKind::GlobalSentiment)
            .and_then(|s| s.history.iter().rev().find(|s| !s.is_expired(now)))
            .cloned()
    }

    /// Top `n` unexpired `HOT_TOKEN` signals, most recent first.
    pub fn get_hot_tokens(&self, n: usize) -> Vec<Signal> {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .state
            .get(&SignalKind::HotToken)
            .map(|s| {
                s.history
                    .iter()
                    .rev()
                    .filter(|s| !s.is_expired(now))
                    .take(n)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_whale_moves(&self, window: Duration) -> Vec<Signal> {
        self.recent(SignalKind::WhaleMove, window)
    }

    pub fn get_news_events(&self, window: Duration) -> Vec<Signal> {
        self.recent(SignalKind::NewsEvent, window)
    }

    /// Weighted, bounded sentiment indicator for `entity` (spec section 4.1).
    ///
    /// 40% average news sentiment x confidence on recent `NEWS_EVENT`s
    /// mentioning `entity` (60 minute window), 30% whale buy/sell imbalance on
    /// recent `WHALE_MOVE`s for `entity` (30 minute window), 20% current
    /// `GLOBAL_SENTIMENT` score, 10% presence in the current hot-token set.
    /// Clamped to `[-1, 1]`.
    pub fn signal_strength(&self, entity: &str) -> Decimal {
        let news_component = self.news_sentiment_component(entity);
        let whale_component = self.whale_imbalance_component(entity);
        let global_component = self
            .get_global_sentiment()
            .map(|s| match s.payload {
                SignalPayload::GlobalSentiment { score, .. } => score,
                _ => Decimal::ZERO,
            })
            .unwrap_or(Decimal::ZERO);
        let hot_component = if self.is_hot_token_entity(entity) {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };

        let weighted = news_component * Decimal::new(40, 2)
            + whale_component * Decimal::new(30, 2)
            + global_component * Decimal::new(20, 2)
            + hot_component * Decimal::new(10, 2);

        clamp_unit(weighted)
    }

    fn news_sentiment_component(&self, entity: &str) -> Decimal {
        let events = self.get_news_events(Duration::from_secs(60 * 60));
        let matching: Vec<_> = events
            .into_iter()
            .filter_map(|s| match s.payload {
                SignalPayload::NewsEvent {
                    entities,
                    sentiment,
                    confidence,
                    ..
                } if entities.iter().any(|e| e == entity) => Some(sentiment * confidence),
                _ => None,
            })
            .collect();

        if matching.is_empty() {
            return Decimal::ZERO;
        }

        let sum: Decimal = matching.iter().copied().sum();
        sum / Decimal::from(matching.len() as u64)
    }

    fn whale_imbalance_component(&self, entity: &str) -> Decimal {
        let moves = self.get_whale_moves(Duration::from_secs(30 * 60));
        let (buys, sells) = moves.into_iter().filter_map(|s| match s.payload {
            SignalPayload::WhaleMove {
                entity: e,
                side,
                usd_amount,
                ..
            } if e == entity => Some((side, usd_amount)),
            _ => None,
        }).fold((Decimal::ZERO, Decimal::ZERO), |(buys, sells), (side, amount)| {
            match side {
                Side::Buy => (buys + amount, sells),
                Side::Sell => (buys, sells + amount),
            }
        });

        let total = buys + sells;
        if total.is_zero() {
            return Decimal::ZERO;
        }

        (buys - sells) / total
    }

    fn is_hot_token_entity(&self, entity: &str) -> bool {
        self.get_hot_tokens(usize::MAX).into_iter().any(|s| {
            matches!(&s.payload, SignalPayload::HotToken { market_name, .. } if market_name == entity)
        })
    }

    /// Advisory position sizing multiplier derived from [`Self::signal_strength`]
    /// (spec section 4.1). Strategies decide whether to apply it.
    pub fn position_multiplier(&self, entity: &str) -> Decimal {
        let strength = self.signal_strength(entity).abs();
        let high = Decimal::new(7, 1);
        let low = Decimal::new(3, 1);

        if strength > high {
            Decimal::new(15, 1) + (strength - high) * Decimal::new(1667, 3)
        } else if strength < low {
            Decimal::new(5, 1) + (strength / low) * Decimal::new(5, 1)
        } else {
            Decimal::ONE
        }
        .clamp(Decimal::new(5, 1), Decimal::new(2, 0))
    }

    /// True when recent activity about `entity` suggests a strategy should
    /// scan more frequently (spec section 4.1).
    pub fn should_increase_scan_frequency(&self, entity: &str) -> bool {
        let high_impact_news = self
            .get_news_events(Duration::from_secs(15 * 60))
            .into_iter()
            .any(|s| {
                matches!(&s.payload, SignalPayload::NewsEvent { entities, impact, .. }
                    if *impact == Impact::High && entities.iter().any(|e| e == entity))
            });

        let recent_whale = self
            .get_whale_moves(Duration::from_secs(30 * 60))
            .into_iter()
            .any(|s| matches!(&s.payload, SignalPayload::WhaleMove { entity: e, .. } if e == entity));

        high_impact_news || recent_whale || self.is_hot_token_entity(entity)
    }
}

fn clamp_unit(value: Decimal) -> Decimal {
    value.clamp(Decimal::NEGATIVE_ONE, Decimal::ONE)
}

/// Helper for producers that want a `now()`-stamped [`Signal`] without
/// repeating `Utc::now()` at every call site.
pub fn now_signal(priority: Priority, source: impl Into<String>, ttl: Option<Duration>, payload: SignalPayload) -> Signal {
    Signal::new(priority, source, Utc::now(), ttl, payload)
}
