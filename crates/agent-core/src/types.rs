use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// RSI at or beyond these bounds classifies a signal as extreme.
pub const RSI_EXTREME_LOW: f64 = 25.0;
pub const RSI_EXTREME_HIGH: f64 = 75.0;
/// RSI at or beyond these bounds (but not extreme) classifies a signal as moderate.
pub const RSI_MODERATE_LOW: f64 = 35.0;
pub const RSI_MODERATE_HIGH: f64 = 65.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn is_actionable(self) -> bool {
        !matches!(self, SignalAction::Hold)
    }

    /// +1 for BUY, -1 for SELL, 0 for HOLD
    pub fn direction(self) -> f64 {
        match self {
            SignalAction::Buy => 1.0,
            SignalAction::Sell => -1.0,
            SignalAction::Hold => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdState {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
}

/// Which Bollinger band the price touched, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandTouch {
    Lower,
    Upper,
}

/// Indicator features captured when the signal was generated.
/// Computed upstream; this crate only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub rsi: f64,
    pub macd: MacdState,
    /// Current volume relative to its moving average (1.0 = average)
    pub volume_ratio: f64,
    pub trend: TrendDirection,
    pub volatility: VolatilityRegime,
    #[serde(default)]
    pub band_touch: Option<BandTouch>,
}

impl FeatureSnapshot {
    /// A snapshot that neither boosts nor penalizes any signal.
    pub fn neutral() -> Self {
        Self {
            rsi: 50.0,
            macd: MacdState::Neutral,
            volume_ratio: 1.0,
            trend: TrendDirection::Sideways,
            volatility: VolatilityRegime::Normal,
            band_touch: None,
        }
    }
}

/// A candidate trade action produced by the upstream analysis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub action: SignalAction,
    pub price: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub features: Option<FeatureSnapshot>,
}

impl TradingSignal {
    pub fn new(
        symbol: impl Into<String>,
        action: SignalAction,
        price: f64,
        confidence: f64,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            price,
            confidence,
            timestamp,
            reason: reason.into(),
            features: None,
        }
    }

    pub fn with_features(mut self, features: FeatureSnapshot) -> Self {
        self.features = Some(features);
        self
    }

    /// Shape checks only; say nothing about whether the signal is worth trading.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(ValidationError::InvalidPrice(self.price));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        if !self.action.is_actionable() {
            return Err(ValidationError::NotActionable);
        }
        if let Some(features) = &self.features {
            if !(0.0..=100.0).contains(&features.rsi) {
                return Err(ValidationError::InvalidFeatures(format!(
                    "RSI {} outside [0, 100]",
                    features.rsi
                )));
            }
            if !features.volume_ratio.is_finite() || features.volume_ratio < 0.0 {
                return Err(ValidationError::InvalidFeatures(format!(
                    "volume ratio {} must be finite and non-negative",
                    features.volume_ratio
                )));
            }
        }
        Ok(())
    }
}

/// Signal category, which determines the minimum confidence it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    ExtremeRsi,
    ModerateRsi,
    BandTouch,
    Other,
}

impl SignalCategory {
    /// RSI bands from the feature snapshot win; the reason tag is consulted
    /// when the snapshot says nothing decisive or is missing.
    pub fn classify(signal: &TradingSignal) -> Self {
        if let Some(features) = &signal.features {
            let rsi = features.rsi;
            if rsi <= RSI_EXTREME_LOW || rsi >= RSI_EXTREME_HIGH {
                return SignalCategory::ExtremeRsi;
            }
            if rsi <= RSI_MODERATE_LOW || rsi >= RSI_MODERATE_HIGH {
                return SignalCategory::ModerateRsi;
            }
            if features.band_touch.is_some() {
                return SignalCategory::BandTouch;
            }
            return match Self::from_reason(&signal.reason) {
                SignalCategory::BandTouch => SignalCategory::BandTouch,
                _ => SignalCategory::Other,
            };
        }
        Self::from_reason(&signal.reason)
    }

    fn from_reason(reason: &str) -> Self {
        let reason = reason.to_ascii_uppercase();
        if reason.contains("RSI_EXTREME") {
            SignalCategory::ExtremeRsi
        } else if reason.contains("RSI_MODERATE") {
            SignalCategory::ModerateRsi
        } else if reason.starts_with("BB") || reason.contains("BAND") {
            SignalCategory::BandTouch
        } else {
            SignalCategory::Other
        }
    }
}

/// Outcome of gating one signal. Exactly one per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Admitted,
    Duplicate,
    RateLimited,
    Cooldown,
    LowConfidence,
    LowEdge,
    Invalid,
}

impl Verdict {
    pub const ALL: [Verdict; 7] = [
        Verdict::Admitted,
        Verdict::Duplicate,
        Verdict::RateLimited,
        Verdict::Cooldown,
        Verdict::LowConfidence,
        Verdict::LowEdge,
        Verdict::Invalid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Admitted => "ADMITTED",
            Verdict::Duplicate => "DUPLICATE",
            Verdict::RateLimited => "RATE_LIMITED",
            Verdict::Cooldown => "COOLDOWN",
            Verdict::LowConfidence => "LOW_CONFIDENCE",
            Verdict::LowEdge => "LOW_EDGE",
            Verdict::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
