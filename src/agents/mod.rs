//! The `Agent` lifecycle trait (spec section 4.7/4.8) and the concrete agents
//! built on it. Mirrors the teacher's `Strategy<E>` trait in shape
//! (lifecycle hooks around an event loop) but is `async` end to end, since
//! agents here drive real network calls rather than react to in-process
//! events synchronously.
pub mod arbitrage;

use crate::error::SwarmError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Shared, lock-free liveness signal an agent beats on every iteration of its
/// run loop; the supervisor reads it from a separate task to detect stalls
/// (spec section 4.8) without needing `&self` access to the agent itself.
#[derive(Clone)]
pub struct Heartbeat(Arc<AtomicI64>);

impl Heartbeat {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(Utc::now().timestamp_millis())))
    }

    pub fn beat(&self) {
        self.0.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0.load(Ordering::Relaxed)).single().unwrap_or_else(Utc::now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_beat())
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// One autonomous trading agent, supervised by [`crate::supervisor::AgentSupervisor`].
///
/// `run` owns the agent's full lifecycle: it should loop, doing work and
/// calling `heartbeat.beat()` on every iteration, until `shutdown` fires, then
/// return `Ok(())`. Returning `Err` signals an unexpected failure that the
/// supervisor will restart the agent for, subject to its backoff and
/// quarantine policy.
#[async_trait]
pub trait Agent: Send {
    fn id(&self) -> &str;

    async fn run(
        &mut self,
        heartbeat: Heartbeat,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), SwarmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_age_grows_with_elapsed_time() {
        let heartbeat = Heartbeat::new();
        let now = heartbeat.last_beat() + chrono::Duration::seconds(5);
        assert_eq!(heartbeat.age(now), chrono::Duration::seconds(5));
    }
}
