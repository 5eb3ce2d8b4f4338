//! Re-exports of the market data wire types for callers that only need the
//! feed's shapes without depending on [`crate::market_data`] directly.
pub use crate::market_data::{IncomingEvent, WireLevel, WireSide};
