use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Order types (exchange-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub order_type: OrderType,
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, size: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit { price },
            ..Self::market(symbol, side, size)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Local shape checks, run before anything is sent.
    pub fn validate(&self) -> Result<(), InvalidOrder> {
        if self.symbol.trim().is_empty() {
            return Err(InvalidOrder("symbol is empty".to_string()));
        }
        if self.size <= Decimal::ZERO {
            return Err(InvalidOrder(format!("size must be positive, got {}", self.size)));
        }
        if let OrderType::Limit { price } = self.order_type {
            if price <= Decimal::ZERO {
                return Err(InvalidOrder(format!(
                    "limit price must be positive, got {}",
                    price
                )));
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid order: {0}")]
pub struct InvalidOrder(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    /// Accepted by the exchange but nothing executed (resting or expired).
    Unfilled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: FillStatus,
    pub filled_size: Decimal,
    pub avg_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl OrderFill {
    pub fn is_filled(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited by exchange: {0}")]
    RateLimited(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Exchange unavailable: {0}")]
    Unavailable(String),
}

impl ExchangeError {
    /// Transient failures may succeed on retry; everything else is fatal for
    /// the current cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::Transport(_) | ExchangeError::RateLimited(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Exchange trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order and wait for the exchange's acknowledgement/fill.
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderFill, ExchangeError>;

    /// Whether this is a paper/simulated venue
    fn is_paper(&self) -> bool;

    /// Exchange name for logging
    fn exchange_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout("5s".into()).is_transient());
        assert!(ExchangeError::Transport("reset".into()).is_transient());
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(!ExchangeError::Rejected("margin".into()).is_transient());
        assert!(!ExchangeError::Unauthorized("bad key".into()).is_transient());
        assert!(!ExchangeError::Unavailable("maintenance".into()).is_transient());
    }

    #[test]
    fn test_order_validation() {
        assert!(OrderRequest::market("BTC", OrderSide::Buy, dec!(0.01))
            .validate()
            .is_ok());
        assert!(OrderRequest::market("BTC", OrderSide::Buy, dec!(0))
            .validate()
            .is_err());
        assert!(OrderRequest::market("", OrderSide::Sell, dec!(1))
            .validate()
            .is_err());
        assert!(OrderRequest::limit("ETH", OrderSide::Sell, dec!(1), dec!(-5))
            .validate()
            .is_err());
    }

    #[test]
    fn test_limit_keeps_fresh_client_id() {
        let a = OrderRequest::limit("ETH", OrderSide::Buy, dec!(1), dec!(3000)).reduce_only();
        let b = OrderRequest::market("ETH", OrderSide::Buy, dec!(1));
        assert_ne!(a.client_order_id, b.client_order_id);
        assert!(a.reduce_only);
        assert_eq!(a.order_type, OrderType::Limit { price: dec!(3000) });
    }
}
