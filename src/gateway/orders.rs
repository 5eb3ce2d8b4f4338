//! Client for the order-entry gateway (spec section 6.2): signed order
//! submission and cancellation. Every submission carries the nonce handed out
//! by [`crate::budget::BudgetManager::next_nonce`] so the gateway can reject
//! replays.
use super::GatewayError;
use crate::signal::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Abstraction over order submission so agents can be unit-tested against a
/// fake without a live order gateway.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError>;
    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Fill-or-kill: filled in full immediately, or not at all.
    Fok,
    /// Immediate-or-cancel: filled as much as possible immediately, remainder cancelled.
    Ioc,
    /// Good-till-cancelled: rests on the book until filled or explicitly cancelled.
    Gtc,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Accepted,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Client for `POST {order_gateway_url}/orders` and `DELETE .../orders/{id}`.
#[derive(Debug, Clone)]
pub struct OrderGatewayClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OrderGatewayClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

}

#[async_trait]
impl OrderExecutor for OrderGatewayClient {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let url = format!("{}/orders", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(order)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::OrderRejected(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::OrderRejected(body));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::OrderRejected(e.to_string()))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response = self
            .http
            .delete(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout)
                } else {
                    GatewayError::OrderRejected(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::OrderRejected(format!(
                "cancel of {order_id} returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Executor used under `--dry-run`: logs what would have been submitted and
/// synthesises an immediate fill without ever reaching the network.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl OrderExecutor for DryRunExecutor {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
        tracing::info!(
            client_order_id = %order.client_order_id,
            token_id = %order.token_id,
            side = ?order.side,
            price = %order.price,
            size = %order.size,
            "dry run: order not submitted"
        );
        Ok(OrderAck {
            order_id: format!("dry-run-{}", order.client_order_id),
            status: OrderStatus::Filled,
            filled_size: order.size,
            avg_fill_price: Some(order.price),
        })
    }

    async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        tracing::info!(order_id, "dry run: cancel not submitted");
        Ok(())
    }
}
