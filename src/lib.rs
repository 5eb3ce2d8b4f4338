//! Coordination substrate for a swarm of autonomous prediction-market trading
//! agents: a shared capital ledger, portfolio-wide risk limits, a typed
//! publish/subscribe signal bus, and a supervisor that keeps agents running.
pub mod agents;
pub mod budget;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod market_data;
pub mod orderbook;
pub mod risk;
pub mod signal;
pub mod supervisor;

pub use error::SwarmError;
