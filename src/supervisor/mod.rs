//! Supervises agent tasks: restarts a crashed or stalled agent with
//! exponential backoff, quarantines one that restarts too often, and drives a
//! graceful shutdown with a grace period (spec section 4.8). The backoff
//! policy mirrors the teacher's `ReconnectionBackoffPolicy`
//! (`barter-data/src/streams/reconnect/stream.rs`): double on failure, cap at
//! a maximum, reset once the thing being supervised runs cleanly again.
use crate::agents::{Agent, Heartbeat};
use crate::config::SupervisorConfig;
use crate::error::SwarmError;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Produces a fresh [`Agent`] instance for each (re)start; agents that
/// crashed may hold invalid internal state, so the supervisor never reuses
/// one across a restart.
pub type AgentFactory = Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

struct Supervised {
    name: String,
    factory: AgentFactory,
}

/// Owns zero or more agents' lifecycles. One `AgentSupervisor` per process
/// (spec section 4.8); each agent it supervises runs in its own Tokio task.
pub struct AgentSupervisor {
    config: SupervisorConfig,
    agents: Vec<Supervised>,
}

impl AgentSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config, agents: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AgentFactory) {
        self.agents.push(Supervised { name: name.into(), factory });
    }

    /// Run every registered agent until `shutdown` fires, then wait up to
    /// `shutdown_grace_period` for them to stop cleanly.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), SwarmError> {
        let config = self.config;
        let mut handles = Vec::new();

        for supervised in self.agents {
            let config = config;
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                supervise_one(supervised, config, shutdown).await
            }));
        }

        for handle in handles {
            match tokio::time::timeout(config.shutdown_grace_period, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(error))) => return Err(error),
                Ok(Err(join_error)) => {
                    return Err(SwarmError::JoinError { entity: "agent", source: join_error })
                }
                Err(_) => {
                    warn!("agent did not stop within the shutdown grace period");
                }
            }
        }

        Ok(())
    }
}

/// Restart-count bookkeeping for the sliding `restart_window` (spec section
/// 4.8: quarantine after `max_restarts_per_window` restarts).
struct RestartWindow {
    restarts: VecDeque<chrono::DateTime<Utc>>,
    window: Duration,
    max: usize,
}

impl RestartWindow {
    fn new(window: Duration, max: usize) -> Self {
        Self { restarts: VecDeque::new(), window, max }
    }

    /// Record a restart now and report whether the agent should be quarantined.
    fn record_and_check(&mut self) -> bool {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        self.restarts.push_back(now);
        while let Some(&front) = self.restarts.front() {
            if now.signed_duration_since(front) > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() > self.max
    }
}

async fn supervise_one(
    supervised: Supervised,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SwarmError> {
    let mut backoff = config.restart_backoff_base;
    let mut restart_window = RestartWindow::new(config.restart_window, config.max_restarts_per_window);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut agent = (supervised.factory)();
        let heartbeat = Heartbeat::new();
        let mut task_handle = tokio::spawn({
            let heartbeat = heartbeat.clone();
            let shutdown = shutdown.clone();
            async move { agent.run(heartbeat, shutdown).await }
        });

        let mut stall_check = tokio::time::interval(config.heartbeat_interval);
        stall_check.tick().await; // first tick fires immediately

        let outcome: Result<(), String> = loop {
            tokio::select! {
                result = &mut task_handle => {
                    break match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(error)) => Err(error.to_string()),
                        Err(join_error) => Err(join_error.to_string()),
                    };
                }
                _ = stall_check.tick() => {
                    let stale = heartbeat.age(Utc::now()) > chrono::Duration::from_std(config.heartbeat_interval * 3).unwrap_or(chrono::Duration::zero());
                    if stale {
                        task_handle.abort();
                        break Err(format!("agent '{}' missed {} consecutive heartbeats", supervised.name, 3));
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = (&mut task_handle).await;
                        return Ok(());
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!(agent = %supervised.name, "agent stopped cleanly");
                return Ok(());
            }
            Err(reason) => {
                error!(agent = %supervised.name, reason, "agent stopped unexpectedly, considering restart");

                if restart_window.record_and_check() {
                    error!(
                        agent = %supervised.name,
                        max = config.max_restarts_per_window,
                        "agent exceeded restart budget; quarantining"
                    );
                    return Err(SwarmError::CoordinationFault(format!(
                        "agent '{}' quarantined after exceeding {} restarts in {:?}",
                        supervised.name, config.max_restarts_per_window, config.restart_window
                    )));
                }

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
                backoff = (backoff * 2).min(config.restart_backoff_max);
            }
        }
    }
}
