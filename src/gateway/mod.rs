//! Thin typed clients over the three external services the swarm depends on
//! (spec sections 6.1-6.3): the market catalog, the order-entry gateway, and
//! the market data feed. None of these retain state beyond a `reqwest::Client`;
//! state lives in [`crate::market_data::MarketDataStream`] and [`crate::ledger`].
pub mod catalog;
pub mod feed;
pub mod orders;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("market data feed error: {0}")]
    Feed(String),

    #[error("catalog request failed: {0}")]
    Catalog(String),

    #[error("order gateway rejected request: {0}")]
    OrderRejected(String),

    #[error("gateway request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
