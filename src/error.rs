use thiserror::Error;

/// Aggregate error type surfaced by the coordination substrate.
///
/// Per the error-handling design: transient gateway errors and capital/risk
/// denials are recovered locally and never reach this type. A [`SwarmError`]
/// either indicates a coordination fault (propagates to the supervisor, which
/// exits the process) or a configuration problem (rejected before the swarm
/// starts trading).
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("coordination fault: {0}")]
    CoordinationFault(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("coordination store error: {0}")]
    Store(#[from] crate::ledger::store::StoreError),

    #[error("gateway error: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),

    #[error("{entity} task panicked or was dropped: {source}")]
    JoinError {
        entity: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl SwarmError {
    /// Whether this error represents the "coordination fault" error kind from
    /// the error-handling design: a bug that could silently mis-state capital
    /// or positions, and therefore must never be recovered locally.
    pub fn is_coordination_fault(&self) -> bool {
        matches!(
            self,
            SwarmError::CoordinationFault(_) | SwarmError::Store(_)
        )
    }
}

/// Reason a `BudgetManager` or `RiskController` declined a request.
///
/// This is deliberately not a [`SwarmError`] variant: a denial is an expected,
/// quiet outcome handled by the requesting agent, not an error for the
/// supervisor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DenyReason {
    InsufficientBudget,
    CircuitBreakerTripped,
    LimitExceeded(String),
    LowSignalQuality,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::InsufficientBudget => write!(f, "insufficient budget"),
            DenyReason::CircuitBreakerTripped => write!(f, "circuit breaker tripped"),
            DenyReason::LimitExceeded(limit) => write!(f, "limit exceeded: {limit}"),
            DenyReason::LowSignalQuality => write!(f, "low signal quality"),
        }
    }
}
