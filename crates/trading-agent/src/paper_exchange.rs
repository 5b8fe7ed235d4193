use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use exchange_trait::{
    ExchangeClient, ExchangeError, FillStatus, OrderFill, OrderRequest, OrderType,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

/// Simulated venue. Limit orders fill at their price, market orders report no
/// average price. Fills, transient failures and latency are random.
pub struct PaperExchange {
    fill_probability: f64,
    transient_failure_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

impl PaperExchange {
    pub fn new(
        fill_probability: f64,
        transient_failure_rate: f64,
        latency: Duration,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            fill_probability: fill_probability.clamp(0.0, 1.0),
            transient_failure_rate: transient_failure_rate.clamp(0.0, 1.0),
            latency,
            rng: Mutex::new(rng),
        }
    }

    fn roll(&self) -> (bool, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let transient = rng.gen_bool(self.transient_failure_rate);
        let filled = rng.gen_bool(self.fill_probability);
        (transient, filled)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderFill, ExchangeError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let (transient, filled) = self.roll();
        if transient {
            return Err(ExchangeError::Timeout(format!(
                "paper venue dropped order {}",
                order.client_order_id
            )));
        }

        let avg_price = match order.order_type {
            OrderType::Limit { price } => Some(price),
            OrderType::Market => None,
        };
        let (status, filled_size, avg_price) = if filled {
            (FillStatus::Filled, order.size, avg_price)
        } else {
            (FillStatus::Unfilled, Decimal::ZERO, None)
        };

        tracing::debug!(
            symbol = %order.symbol,
            side = ?order.side,
            size = %order.size,
            ?status,
            "Paper order"
        );

        Ok(OrderFill {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            status,
            filled_size,
            avg_price,
            timestamp: Utc::now(),
        })
    }

    fn is_paper(&self) -> bool {
        true
    }

    fn exchange_name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange_trait::OrderSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_always_fills_at_limit_price() {
        let exchange = PaperExchange::new(1.0, 0.0, Duration::ZERO, Some(7));
        let order = OrderRequest::limit("BTC", OrderSide::Buy, dec!(0.01), dec!(90000));
        let fill = exchange.submit_order(&order).await.unwrap();
        assert!(fill.is_filled());
        assert_eq!(fill.avg_price, Some(dec!(90000)));
        assert_eq!(fill.client_order_id, order.client_order_id);
    }

    #[tokio::test]
    async fn test_never_fills() {
        let exchange = PaperExchange::new(0.0, 0.0, Duration::ZERO, Some(7));
        let order = OrderRequest::market("ETH", OrderSide::Sell, dec!(1));
        let fill = exchange.submit_order(&order).await.unwrap();
        assert_eq!(fill.status, FillStatus::Unfilled);
        assert!(!fill.is_filled());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retryable() {
        let exchange = PaperExchange::new(1.0, 1.0, Duration::ZERO, Some(7));
        let order = OrderRequest::market("ETH", OrderSide::Sell, dec!(1));
        let err = exchange.submit_order(&order).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_seed_is_reproducible() {
        let order = OrderRequest::market("SOL", OrderSide::Buy, dec!(2));
        let mut runs = Vec::new();
        for _ in 0..2 {
            let exchange = PaperExchange::new(0.5, 0.2, Duration::ZERO, Some(42));
            let mut outcomes = Vec::new();
            for _ in 0..20 {
                outcomes.push(match exchange.submit_order(&order).await {
                    Ok(fill) => Some(fill.is_filled()),
                    Err(_) => None,
                });
            }
            runs.push(outcomes);
        }
        assert_eq!(runs[0], runs[1]);
    }
}
