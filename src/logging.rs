//! Logging initialisation, following the teacher's `init_logging`/`init_json_logging` split.
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn default_level(verbose: bool) -> tracing_subscriber::filter::LevelFilter {
    if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    }
}

/// Initialise default non-JSON logging. Level is controlled by `RUST_LOG`,
/// defaulting to `info` (or `debug` when `--verbose` is set).
pub fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(default_level(verbose).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init()
}

/// Initialise JSON logging, useful when log output is shipped to a collector.
pub fn init_json_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(default_level(verbose).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .init()
}

/// Stable log tags referenced by the error-handling design (spec section 7).
/// Every denial and every realized leg risk is logged with one of these tags
/// so operators can grep the log stream for them.
pub mod tag {
    pub const DENY_BUDGET: &str = "DENY:BUDGET";
    pub const DENY_RISK: &str = "DENY:RISK";
    pub const LEG_RISK_HEDGE: &str = "LEG_RISK:HEDGE";
    pub const CB_TRIPPED: &str = "CB:TRIPPED";
}
