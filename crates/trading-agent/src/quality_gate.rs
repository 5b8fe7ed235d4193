//! Signal quality gate
//!
//! Scores a raw signal's confidence from its feature snapshot, applies the
//! category-tiered minimum, the fee-aware edge check and the signal-level
//! cooldowns. The only state it keeps is the last entry per symbol, written
//! by [`SignalQualityGate::record_entry`] once an order actually goes out.

use agent_core::{
    MacdState, SignalAction, SignalCategory, TradingSignal, TrendDirection, ValidationError,
    Verdict, VolatilityRegime, RSI_EXTREME_HIGH, RSI_EXTREME_LOW, RSI_MODERATE_HIGH,
    RSI_MODERATE_LOW,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::QualityGateConfig;
use crate::types::MarketContext;

#[derive(Debug, Clone, PartialEq)]
pub enum QualityRejection {
    LowConfidence {
        confidence: f64,
        threshold: f64,
    },
    LowEdge {
        expected: f64,
        required: f64,
    },
    Cooldown {
        remaining: Option<Duration>,
        detail: String,
    },
    Invalid(ValidationError),
}

impl QualityRejection {
    pub fn verdict(&self) -> Verdict {
        match self {
            QualityRejection::LowConfidence { .. } => Verdict::LowConfidence,
            QualityRejection::LowEdge { .. } => Verdict::LowEdge,
            QualityRejection::Cooldown { .. } => Verdict::Cooldown,
            QualityRejection::Invalid(_) => Verdict::Invalid,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            QualityRejection::LowConfidence {
                confidence,
                threshold,
            } => format!(
                "confidence {:.3} below category minimum {:.2}",
                confidence, threshold
            ),
            QualityRejection::LowEdge { expected, required } => format!(
                "expected move {:.6} does not exceed required edge {:.6}",
                expected, required
            ),
            QualityRejection::Cooldown { detail, .. } => detail.clone(),
            QualityRejection::Invalid(e) => e.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityAssessment {
    pub accept: bool,
    /// Adjusted confidence (input confidence when features are missing)
    pub confidence: f64,
    pub category: SignalCategory,
    pub threshold: f64,
    pub rejection: Option<QualityRejection>,
}

impl QualityAssessment {
    fn rejected(
        confidence: f64,
        category: SignalCategory,
        threshold: f64,
        rejection: QualityRejection,
    ) -> Self {
        Self {
            accept: false,
            confidence,
            category,
            threshold,
            rejection: Some(rejection),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.rejection.as_ref().map(QualityRejection::verdict)
    }
}

#[derive(Debug, Clone)]
struct LastEntry {
    timestamp: DateTime<Utc>,
    action: SignalAction,
    price: f64,
}

pub struct SignalQualityGate {
    config: QualityGateConfig,
    last_entry: DashMap<String, LastEntry>,
}

impl SignalQualityGate {
    pub fn new(config: QualityGateConfig) -> Self {
        Self {
            config,
            last_entry: DashMap::new(),
        }
    }

    pub fn min_confidence(&self, category: SignalCategory) -> f64 {
        match category {
            SignalCategory::ExtremeRsi => self.config.extreme_rsi_min_confidence,
            SignalCategory::ModerateRsi => self.config.moderate_rsi_min_confidence,
            SignalCategory::BandTouch => self.config.band_touch_min_confidence,
            SignalCategory::Other => self.config.default_min_confidence,
        }
    }

    /// Confidence after feature adjustments, clamped to [0, 1].
    pub fn score_confidence(&self, signal: &TradingSignal) -> f64 {
        let Some(features) = &signal.features else {
            return signal.confidence.clamp(0.0, 1.0);
        };
        let cfg = &self.config;
        let mut confidence = signal.confidence;

        // RSI past the category's band, scaled by how far it sits toward 0/100
        let (low, high) = match SignalCategory::classify(signal) {
            SignalCategory::ExtremeRsi => (RSI_EXTREME_LOW, RSI_EXTREME_HIGH),
            _ => (RSI_MODERATE_LOW, RSI_MODERATE_HIGH),
        };
        let depth = match signal.action {
            SignalAction::Buy => (low - features.rsi) / low,
            SignalAction::Sell => (features.rsi - high) / (100.0 - high),
            SignalAction::Hold => 0.0,
        };
        if depth > 0.0 {
            confidence += cfg.rsi_boost_weight * depth.min(1.0);
        }

        let macd_aligned = matches!(
            (signal.action, features.macd),
            (SignalAction::Buy, MacdState::Bullish) | (SignalAction::Sell, MacdState::Bearish)
        );
        if macd_aligned {
            confidence += cfg.macd_alignment_boost;
        }

        if features.volume_ratio >= cfg.volume_confirmation_ratio {
            confidence += cfg.volume_boost;
        }

        let counter_trend = matches!(
            (signal.action, features.trend),
            (SignalAction::Buy, TrendDirection::Down) | (SignalAction::Sell, TrendDirection::Up)
        );
        if counter_trend {
            confidence -= cfg.counter_trend_penalty;
        }

        confidence += match features.volatility {
            VolatilityRegime::Low => cfg.low_volatility_boost,
            VolatilityRegime::Normal => 0.0,
            VolatilityRegime::High => -cfg.high_volatility_penalty,
        };

        confidence.clamp(0.0, 1.0)
    }

    /// (expected, required). Compared in quote currency when the notional is
    /// known, otherwise as fractions of price.
    fn edge(&self, ctx: &MarketContext) -> (f64, f64) {
        let multiple = self.config.edge_fee_multiple;
        if ctx.notional > 0.0 {
            let per_side = (ctx.notional * ctx.fee_rate).max(ctx.min_fee);
            (ctx.notional * ctx.expected_move_pct, multiple * 2.0 * per_side)
        } else {
            (ctx.expected_move_pct, multiple * 2.0 * ctx.fee_rate)
        }
    }

    /// Read-only. Callers serialize `evaluate` and `record_entry` per symbol.
    pub fn evaluate(&self, signal: &TradingSignal, ctx: &MarketContext) -> QualityAssessment {
        let category = SignalCategory::classify(signal);
        let threshold = self.min_confidence(category);

        if let Err(e) = signal.validate() {
            tracing::warn!(symbol = %signal.symbol, "Dropping malformed signal: {}", e);
            return QualityAssessment::rejected(
                signal.confidence,
                category,
                threshold,
                QualityRejection::Invalid(e),
            );
        }

        let confidence = self.score_confidence(signal);
        if confidence < threshold {
            return QualityAssessment::rejected(
                confidence,
                category,
                threshold,
                QualityRejection::LowConfidence {
                    confidence,
                    threshold,
                },
            );
        }

        let (expected, required) = self.edge(ctx);
        if expected <= required {
            return QualityAssessment::rejected(
                confidence,
                category,
                threshold,
                QualityRejection::LowEdge { expected, required },
            );
        }

        if let Some(last) = self.last_entry.get(&signal.symbol) {
            if signal.timestamp < last.timestamp {
                let e = ValidationError::TimestampRegression {
                    symbol: signal.symbol.clone(),
                    last: last.timestamp,
                    got: signal.timestamp,
                };
                tracing::warn!(symbol = %signal.symbol, "Dropping out-of-order signal: {}", e);
                return QualityAssessment::rejected(
                    confidence,
                    category,
                    threshold,
                    QualityRejection::Invalid(e),
                );
            }
            if let Some(rejection) = self.cooldown_rejection(&last, signal) {
                return QualityAssessment::rejected(confidence, category, threshold, rejection);
            }
        }

        QualityAssessment {
            accept: true,
            confidence,
            category,
            threshold,
            rejection: None,
        }
    }

    /// Make `signal` the reference for later cooldown and re-entry checks.
    /// Older signals never replace a newer entry.
    pub fn record_entry(&self, signal: &TradingSignal) {
        let entry = LastEntry {
            timestamp: signal.timestamp,
            action: signal.action,
            price: signal.price,
        };
        match self.last_entry.entry(signal.symbol.clone()) {
            Entry::Occupied(mut last) => {
                if last.get().timestamp <= signal.timestamp {
                    last.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    fn cooldown_rejection(
        &self,
        last: &LastEntry,
        signal: &TradingSignal,
    ) -> Option<QualityRejection> {
        let elapsed = signal.timestamp - last.timestamp;

        let fresh = Duration::seconds(self.config.fresh_entry_cooldown_secs);
        if elapsed < fresh {
            return Some(QualityRejection::Cooldown {
                remaining: Some(fresh - elapsed),
                detail: format!(
                    "signal cooldown: {}ms since last entry",
                    elapsed.num_milliseconds()
                ),
            });
        }

        if signal.action != last.action {
            return None;
        }

        let reentry = Duration::seconds(self.config.reentry_cooldown_secs);
        if elapsed < reentry {
            return Some(QualityRejection::Cooldown {
                remaining: Some(reentry - elapsed),
                detail: format!(
                    "re-entry cooldown: same-direction signal after {}s",
                    elapsed.num_seconds()
                ),
            });
        }

        let price_move = (signal.price - last.price).abs() / last.price;
        if price_move < self.config.reentry_min_price_move {
            return Some(QualityRejection::Cooldown {
                remaining: None,
                detail: format!(
                    "re-entry needs a {:.2}% price move, got {:.3}%",
                    self.config.reentry_min_price_move * 100.0,
                    price_move * 100.0
                ),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{BandTouch, FeatureSnapshot};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn signal(action: SignalAction, price: f64, confidence: f64, secs: i64, reason: &str) -> TradingSignal {
        TradingSignal::new("BTC", action, price, confidence, t0() + Duration::seconds(secs), reason)
    }

    fn ctx() -> MarketContext {
        MarketContext::new(0.004, 0.0005)
    }

    fn gate() -> SignalQualityGate {
        SignalQualityGate::new(QualityGateConfig::default())
    }

    /// Evaluate, and record the entry the way the pipeline does once sent.
    fn enter(gate: &SignalQualityGate, s: &TradingSignal) -> QualityAssessment {
        let result = gate.evaluate(s, &ctx());
        if result.accept {
            gate.record_entry(s);
        }
        result
    }

    #[test]
    fn test_moderate_rsi_below_threshold_is_low_confidence() {
        let result = gate().evaluate(
            &signal(SignalAction::Buy, 90_000.0, 0.74, 0, "RSI_MODERATE"),
            &ctx(),
        );
        assert!(!result.accept);
        assert_eq!(result.verdict(), Some(Verdict::LowConfidence));
        assert_eq!(result.threshold, 0.75);
    }

    #[test]
    fn test_thresholds_are_tiered_by_category() {
        let gate = gate();
        // 0.78 clears moderate (0.75) but not extreme (0.80)
        let extreme = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.78, 0, "RSI_EXTREME"), &ctx());
        assert_eq!(extreme.verdict(), Some(Verdict::LowConfidence));

        let band = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.73, 0, "BB_LOWER"), &ctx());
        assert!(band.accept, "{:?}", band.rejection);
        assert_eq!(band.category, SignalCategory::BandTouch);

        let other = gate.evaluate(&signal(SignalAction::Sell, 100.0, 0.73, 100, "MACD_CROSS"), &ctx());
        assert_eq!(other.verdict(), Some(Verdict::LowConfidence));
    }

    #[test]
    fn test_feature_adjustments() {
        let gate = gate();
        let base = signal(SignalAction::Buy, 100.0, 0.70, 0, "x");

        let supportive = FeatureSnapshot {
            rsi: 17.5,
            macd: MacdState::Bullish,
            volume_ratio: 2.0,
            trend: TrendDirection::Up,
            volatility: VolatilityRegime::Low,
            band_touch: None,
        };
        let boosted = gate.score_confidence(&base.clone().with_features(supportive));
        // RSI 17.5 is extreme, so depth is (25 - 17.5) / 25 = 0.3 -> +0.03;
        // MACD +0.05, volume +0.05, low volatility +0.03
        assert!((boosted - (0.70 + 0.03 + 0.05 + 0.05 + 0.03)).abs() < 1e-9);

        let hostile = FeatureSnapshot {
            rsi: 50.0,
            macd: MacdState::Bearish,
            volume_ratio: 0.5,
            trend: TrendDirection::Down,
            volatility: VolatilityRegime::High,
            band_touch: None,
        };
        let penalized = gate.score_confidence(&base.clone().with_features(hostile));
        assert!((penalized - (0.70 - 0.10 - 0.05)).abs() < 1e-9);

        let neutral = gate.score_confidence(&base.with_features(FeatureSnapshot::neutral()));
        assert!((neutral - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let gate = gate();
        let features = FeatureSnapshot {
            rsi: 2.0,
            macd: MacdState::Bullish,
            volume_ratio: 3.0,
            trend: TrendDirection::Up,
            volatility: VolatilityRegime::Low,
            band_touch: Some(BandTouch::Lower),
        };
        let s = signal(SignalAction::Buy, 100.0, 0.98, 0, "x").with_features(features);
        assert_eq!(gate.score_confidence(&s), 1.0);
    }

    #[test]
    fn test_edge_must_exceed_fee_multiple() {
        let gate = gate();
        // Round trip 0.1%, required 0.15%
        let thin = MarketContext::new(0.0012, 0.0005);
        let result = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.95, 0, "x"), &thin);
        assert_eq!(result.verdict(), Some(Verdict::LowEdge));

        // Minimum fee dominates on a small notional
        let small = MarketContext {
            expected_move_pct: 0.004,
            fee_rate: 0.0005,
            min_fee: 1.0,
            notional: 100.0,
        };
        let result = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.95, 0, "x"), &small);
        assert_eq!(result.verdict(), Some(Verdict::LowEdge));

        let result = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.95, 0, "x"), &ctx());
        assert!(result.accept);
    }

    #[test]
    fn test_fresh_entry_cooldown() {
        let gate = gate();
        assert!(enter(&gate, &signal(SignalAction::Buy, 100.0, 0.9, 0, "x")).accept);

        let flip = gate.evaluate(&signal(SignalAction::Sell, 100.0, 0.9, 3, "x"), &ctx());
        assert_eq!(flip.verdict(), Some(Verdict::Cooldown));

        let flip = gate.evaluate(&signal(SignalAction::Sell, 100.0, 0.9, 5, "x"), &ctx());
        assert!(flip.accept);
    }

    #[test]
    fn test_reentry_needs_time_and_price_move() {
        let gate = gate();
        assert!(enter(&gate, &signal(SignalAction::Buy, 100.0, 0.9, 0, "x")).accept);

        let early = gate.evaluate(&signal(SignalAction::Buy, 101.0, 0.9, 7, "x"), &ctx());
        match early.rejection {
            Some(QualityRejection::Cooldown { remaining, .. }) => {
                assert_eq!(remaining, Some(Duration::seconds(3)))
            }
            other => panic!("expected cooldown, got {:?}", other),
        }

        let flat = gate.evaluate(&signal(SignalAction::Buy, 100.05, 0.9, 12, "x"), &ctx());
        assert_eq!(flat.verdict(), Some(Verdict::Cooldown));

        let moved = gate.evaluate(&signal(SignalAction::Buy, 100.2, 0.9, 12, "x"), &ctx());
        assert!(moved.accept);
    }

    #[test]
    fn test_rejections_do_not_reset_cooldown_state() {
        let gate = gate();
        assert!(enter(&gate, &signal(SignalAction::Buy, 100.0, 0.9, 0, "x")).accept);
        // Low-confidence signal at t=20 must not become the new reference
        let weak = enter(&gate, &signal(SignalAction::Sell, 100.0, 0.5, 20, "x"));
        assert_eq!(weak.verdict(), Some(Verdict::LowConfidence));
        assert!(enter(&gate, &signal(SignalAction::Sell, 100.0, 0.9, 21, "x")).accept);
    }

    #[test]
    fn test_evaluation_alone_keeps_prior_entry() {
        let gate = gate();
        assert!(enter(&gate, &signal(SignalAction::Buy, 100.0, 0.9, 0, "x")).accept);

        // Accepted by the gate but never sent
        let passed = gate.evaluate(&signal(SignalAction::Buy, 100.2, 0.9, 61, "x"), &ctx());
        assert!(passed.accept);

        // Re-entry is still measured from 100.0
        let same_price = gate.evaluate(&signal(SignalAction::Buy, 100.0, 0.9, 700, "x"), &ctx());
        assert_eq!(same_price.verdict(), Some(Verdict::Cooldown));
    }

    #[test]
    fn test_older_entry_never_replaces_newer() {
        let gate = gate();
        gate.record_entry(&signal(SignalAction::Buy, 100.0, 0.9, 60, "x"));
        gate.record_entry(&signal(SignalAction::Buy, 50.0, 0.9, 30, "x"));

        let flat = gate.evaluate(&signal(SignalAction::Buy, 100.05, 0.9, 90, "x"), &ctx());
        assert_eq!(flat.verdict(), Some(Verdict::Cooldown));
    }

    #[test]
    fn test_out_of_order_and_malformed_signals_are_invalid() {
        let gate = gate();
        assert!(enter(&gate, &signal(SignalAction::Buy, 100.0, 0.9, 60, "x")).accept);

        let stale = gate.evaluate(&signal(SignalAction::Sell, 100.0, 0.9, 30, "x"), &ctx());
        assert_eq!(stale.verdict(), Some(Verdict::Invalid));

        let hold = gate.evaluate(&signal(SignalAction::Hold, 100.0, 0.9, 90, "x"), &ctx());
        assert_eq!(hold.verdict(), Some(Verdict::Invalid));
    }

    proptest! {
        /// Anything under its category minimum is never accepted.
        #[test]
        fn below_threshold_never_accepted(
            confidence in 0.0..1.0_f64,
            rsi in 0.0..100.0_f64,
            sell in any::<bool>(),
        ) {
            let gate = gate();
            let action = if sell { SignalAction::Sell } else { SignalAction::Buy };
            let mut features = FeatureSnapshot::neutral();
            features.rsi = rsi;
            let s = signal(action, 100.0, confidence, 0, "x").with_features(features);

            let scored = gate.score_confidence(&s);
            let threshold = gate.min_confidence(SignalCategory::classify(&s));
            let result = gate.evaluate(&s, &ctx());
            if scored < threshold {
                prop_assert!(!result.accept);
                prop_assert!(matches!(
                    result.verdict(),
                    Some(Verdict::LowConfidence) | Some(Verdict::LowEdge)
                ));
            }
        }
    }
}
