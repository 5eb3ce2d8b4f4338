//! Read-only client for the market catalog service (spec section 6.1): the
//! set of currently tradable markets and their outcome tokens.
use super::GatewayError;
use serde::Deserialize;
use std::time::Duration;

/// One tradable market as returned by the catalog service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketSummary {
    pub market_id: String,
    pub question: String,
    pub token_ids: Vec<String>,
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<MarketSummary>,
}

/// Client for `GET {catalog_url}?closed=false`.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Fetch every open market, newest additions last.
    pub async fn list_open_markets(&self) -> Result<Vec<MarketSummary>, GatewayError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("closed", "false")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::Catalog(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Catalog(format!(
                "catalog returned status {}",
                response.status()
            )));
        }

        let body: MarketsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Catalog(e.to_string()))?;
        Ok(body.markets)
    }
}
