use anyhow::Result;
use reqwest::Client;
use serde_json::json;

/// Conditions worth waking someone up for.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    CriticalFillRate { symbol: String, fill_rate: f64 },
    FatalExchangeError { symbol: String, error: String },
    UntestedStrategy { strategy: String, size_multiplier: f64 },
    EmergencyStop,
}

impl Alert {
    pub fn message(&self) -> String {
        match self {
            Alert::CriticalFillRate { symbol, fill_rate } => format!(
                "**Critical fill rate** on {}: {:.1}% of recent orders filled. Extended cooldown in force.",
                symbol,
                fill_rate * 100.0
            ),
            Alert::FatalExchangeError { symbol, error } => {
                format!("**Order failed (fatal)** on {}: {}", symbol, error)
            }
            Alert::UntestedStrategy {
                strategy,
                size_multiplier,
            } => format!(
                "**Untested strategy in use**: `{}` at {:.2}x size. No candidate passed the backtest filters.",
                strategy, size_multiplier
            ),
            Alert::EmergencyStop => {
                "**Emergency stop**: order submission halted.".to_string()
            }
        }
    }
}

/// Discord-style webhook. Without a URL every send is a no-op.
pub struct AlertNotifier {
    client: Client,
    webhook_url: String,
}

impl AlertNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        if !self.is_enabled() {
            tracing::debug!("Alert webhook not configured, skipping notification");
            return Ok(());
        }

        let payload = json!({
            "content": content,
            "username": "PerpGuard Order Pipeline",
        });

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!("Alert notification sent");
        Ok(())
    }

    /// Send and log on failure; alerting never interrupts trading.
    pub async fn alert(&self, alert: &Alert) {
        if let Err(e) = self.send_message(&alert.message()).await {
            tracing::warn!("Failed to deliver alert {:?}: {}", alert, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_symbol() {
        let alert = Alert::CriticalFillRate {
            symbol: "DOGE".into(),
            fill_rate: 0.04,
        };
        let msg = alert.message();
        assert!(msg.contains("DOGE"));
        assert!(msg.contains("4.0%"));
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = AlertNotifier::new(String::new());
        assert!(!notifier.is_enabled());
        notifier.send_message("hello").await.unwrap();
        notifier.alert(&Alert::EmergencyStop).await;
    }
}
