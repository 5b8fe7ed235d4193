use std::sync::Arc;

use agent_core::TradingSignal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Market facts the quality gate needs beyond the signal itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    /// Expected favourable move as a fraction of price (0.004 = 0.4%)
    pub expected_move_pct: f64,
    /// Fee per side as a fraction of notional
    pub fee_rate: f64,
    /// Minimum fee charged per order, in quote currency
    #[serde(default)]
    pub min_fee: f64,
    /// Order notional the fee applies to; zero compares in percent terms
    #[serde(default)]
    pub notional: f64,
}

impl MarketContext {
    pub fn new(expected_move_pct: f64, fee_rate: f64) -> Self {
        Self {
            expected_move_pct,
            fee_rate,
            min_fee: 0.0,
            notional: 0.0,
        }
    }

    pub fn with_notional(mut self, notional: f64) -> Self {
        self.notional = notional;
        self
    }
}

/// One line of the inbound signal stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSignal {
    pub signal: TradingSignal,
    #[serde(default)]
    pub context: Option<MarketContext>,
}

/// Process-wide emergency stop. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct EmergencyStop {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyStop {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            tracing::warn!("Emergency stop triggered; in-flight submissions will abort");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the stop has been triggered.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emergency_stop_wakes_waiters() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_triggered());

        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.triggered().await })
        };
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(stop.is_triggered());

        // Already triggered: resolves immediately.
        stop.triggered().await;
    }

    #[test]
    fn inbound_signal_context_is_optional() {
        let line = r#"{"signal":{"symbol":"SOL","action":"BUY","price":150.0,"confidence":0.8,
            "timestamp":"2025-01-01T00:00:00Z","reason":"MACD_CROSS"}}"#;
        let inbound: InboundSignal = serde_json::from_str(line).unwrap();
        assert!(inbound.context.is_none());
        assert_eq!(inbound.signal.symbol, "SOL");
    }
}
