//! Signal admission control
//!
//! Runs on signals the quality gate accepted. Rejects duplicates of the last
//! admitted signal, enforces a sliding-window rate limit, and applies the
//! order-level cooldowns (per symbol and global). Also owns the single global
//! order slot every submission must claim first.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use agent_core::{SharedClock, SignalAction, TradingSignal, Verdict};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::AdmissionConfig;
use crate::stats::{AdmissionStats, VerdictLedger};

/// Compact signature of the most recently admitted signal for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalFingerprint {
    pub symbol: String,
    pub action: SignalAction,
    pub price: f64,
    pub confidence: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl SignalFingerprint {
    pub fn of(signal: &TradingSignal) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            action: signal.action,
            price: signal.price,
            confidence: signal.confidence,
            reason: signal.reason.clone(),
            timestamp: signal.timestamp,
        }
    }

    pub fn is_duplicate(&self, signal: &TradingSignal, config: &AdmissionConfig) -> bool {
        let age = (signal.timestamp - self.timestamp).abs();
        let price_delta = (signal.price - self.price).abs() / self.price;
        let confidence_delta = (signal.confidence - self.confidence).abs();

        self.action == signal.action
            && age < Duration::seconds(config.dedup_window_secs)
            && price_delta < config.dedup_price_tolerance
            && confidence_delta < config.dedup_confidence_tolerance
            && self.reason == signal.reason
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    pub verdict: Verdict,
    pub detail: String,
    /// Time until the blocking condition clears, when one applies
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    fn admitted() -> Self {
        Self {
            verdict: Verdict::Admitted,
            detail: "admitted".to_string(),
            retry_after: None,
        }
    }

    fn rejected(verdict: Verdict, detail: String, retry_after: Option<Duration>) -> Self {
        Self {
            verdict,
            detail,
            retry_after,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admitted
    }
}

/// A claimed order submission. Hand it back with
/// [`SignalAdmissionController::release_order_slot`] if nothing was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSlot {
    pub claimed_at: DateTime<Utc>,
    previous_symbol: Option<DateTime<Utc>>,
    previous_global: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SymbolAdmissionState {
    fingerprint: Option<SignalFingerprint>,
    admissions: VecDeque<DateTime<Utc>>,
    last_order_at: Option<DateTime<Utc>>,
}

pub struct SignalAdmissionController {
    config: AdmissionConfig,
    clock: SharedClock,
    symbols: DashMap<String, SymbolAdmissionState>,
    // Lock order: a symbol entry first, then this.
    last_global_order: Mutex<Option<DateTime<Utc>>>,
    ledger: VerdictLedger,
}

impl SignalAdmissionController {
    pub fn new(config: AdmissionConfig, clock: SharedClock) -> Self {
        tracing::info!(
            "Admission control: {} signals/{}s, dedup {}s, order cooldown {}s, global interval {}s",
            config.rate_limit_max_signals,
            config.rate_limit_window_secs,
            config.dedup_window_secs,
            config.symbol_order_cooldown_secs,
            config.global_order_interval_secs
        );
        Self {
            config,
            clock,
            symbols: DashMap::new(),
            last_global_order: Mutex::new(None),
            ledger: VerdictLedger::new(),
        }
    }

    pub fn admit(&self, signal: &TradingSignal) -> AdmissionDecision {
        let now = self.clock.now();
        let decision = {
            let mut state = self.symbols.entry(signal.symbol.clone()).or_default();
            self.decide(&mut state, signal, now)
        };

        self.ledger.record(&signal.symbol, decision.verdict);
        if decision.is_admitted() {
            tracing::info!(
                symbol = %signal.symbol,
                action = %signal.action,
                price = signal.price,
                confidence = signal.confidence,
                "Signal admitted"
            );
        } else {
            tracing::debug!(
                symbol = %signal.symbol,
                verdict = %decision.verdict,
                "Signal rejected: {}",
                decision.detail
            );
        }
        decision
    }

    fn decide(
        &self,
        state: &mut SymbolAdmissionState,
        signal: &TradingSignal,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let cfg = &self.config;

        // 1. Deduplication against the last admitted fingerprint
        if let Some(fp) = &state.fingerprint {
            if fp.is_duplicate(signal, cfg) {
                return AdmissionDecision::rejected(
                    Verdict::Duplicate,
                    format!(
                        "duplicate of {} {} @ {:.4} admitted {}s earlier",
                        fp.action,
                        fp.reason,
                        fp.price,
                        (signal.timestamp - fp.timestamp).num_seconds()
                    ),
                    None,
                );
            }
        }

        // 2. Sliding-window rate limit over admission timestamps
        let window = Duration::seconds(cfg.rate_limit_window_secs);
        let ts = signal.timestamp;
        state.admissions.retain(|t| ts - *t < window);
        let oldest_in_window = state
            .admissions
            .iter()
            .filter(|t| **t - ts < window)
            .min()
            .copied();
        let in_window = state
            .admissions
            .iter()
            .filter(|t| **t - ts < window)
            .count();
        if in_window >= cfg.rate_limit_max_signals {
            return AdmissionDecision::rejected(
                Verdict::RateLimited,
                format!(
                    "{} signals admitted in the last {}s (max {})",
                    in_window, cfg.rate_limit_window_secs, cfg.rate_limit_max_signals
                ),
                oldest_in_window.map(|t| (t + window - ts).max(Duration::zero())),
            );
        }

        // 3. Order-level cooldowns; the most restrictive one is reported
        if let Some((remaining, detail)) = self.order_cooldown(state, now) {
            return AdmissionDecision::rejected(Verdict::Cooldown, detail, Some(remaining));
        }

        state.fingerprint = Some(SignalFingerprint::of(signal));
        state.admissions.push_back(ts);
        AdmissionDecision::admitted()
    }

    fn order_cooldown(
        &self,
        state: &SymbolAdmissionState,
        now: DateTime<Utc>,
    ) -> Option<(Duration, String)> {
        let symbol_remaining = state
            .last_order_at
            .map(|t| t + Duration::seconds(self.config.symbol_order_cooldown_secs) - now)
            .filter(|d| *d > Duration::zero());

        let global_remaining = self
            .last_global_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t + Duration::seconds(self.config.global_order_interval_secs) - now)
            .filter(|d| *d > Duration::zero());

        match (symbol_remaining, global_remaining) {
            (None, None) => None,
            (Some(s), Some(g)) if s >= g => Some((
                s,
                format!("symbol order cooldown: {}s remaining (global also active)", s.num_seconds()),
            )),
            (Some(s), None) => Some((s, format!("symbol order cooldown: {}s remaining", s.num_seconds()))),
            (_, Some(g)) => Some((
                g,
                format!("global order interval: {}s remaining", g.num_seconds()),
            )),
        }
    }

    /// Atomically check both order cooldowns and, if clear, mark `symbol` as
    /// submitting now. Must succeed before any order reaches the exchange.
    pub fn claim_order_slot(&self, symbol: &str) -> Result<OrderSlot, AdmissionDecision> {
        let now = self.clock.now();
        let mut state = self.symbols.entry(symbol.to_string()).or_default();

        if let Some((remaining, detail)) = self.order_cooldown(&state, now) {
            return Err(AdmissionDecision::rejected(
                Verdict::Cooldown,
                detail,
                Some(remaining),
            ));
        }

        let mut global = self
            .last_global_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Re-check under the global lock; another symbol may have claimed in between.
        if let Some(last) = *global {
            let remaining = last + Duration::seconds(self.config.global_order_interval_secs) - now;
            if remaining > Duration::zero() {
                return Err(AdmissionDecision::rejected(
                    Verdict::Cooldown,
                    format!("global order interval: {}s remaining", remaining.num_seconds()),
                    Some(remaining),
                ));
            }
        }

        let slot = OrderSlot {
            claimed_at: now,
            previous_symbol: state.last_order_at,
            previous_global: *global,
        };
        *global = Some(now);
        state.last_order_at = Some(now);
        Ok(slot)
    }

    /// Undo a claim whose order never reached the exchange. Later claims are
    /// left untouched.
    pub fn release_order_slot(&self, symbol: &str, slot: OrderSlot) {
        if let Some(mut state) = self.symbols.get_mut(symbol) {
            if state.last_order_at == Some(slot.claimed_at) {
                state.last_order_at = slot.previous_symbol;
            }
        }
        let mut global = self
            .last_global_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *global == Some(slot.claimed_at) {
            *global = slot.previous_global;
        }
        tracing::debug!(symbol, "Released unused order slot");
    }

    pub fn fingerprint(&self, symbol: &str) -> Option<SignalFingerprint> {
        self.symbols
            .get(symbol)
            .and_then(|state| state.fingerprint.clone())
    }

    /// Verdict counts per symbol and overall. Read-only.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats::from_per_symbol(self.ledger.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::ManualClock;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn controller() -> (SignalAdmissionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        (
            SignalAdmissionController::new(AdmissionConfig::default(), clock.clone()),
            clock,
        )
    }

    fn signal(symbol: &str, price: f64, confidence: f64, secs: i64) -> TradingSignal {
        TradingSignal::new(
            symbol,
            SignalAction::Buy,
            price,
            confidence,
            t0() + Duration::seconds(secs),
            "RSI_MODERATE",
        )
    }

    #[test]
    fn test_near_identical_signal_is_duplicate() {
        let (ac, clock) = controller();
        assert!(ac.admit(&signal("BTC", 90_000.0, 0.78, 0)).is_admitted());

        clock.advance(Duration::seconds(60));
        let decision = ac.admit(&signal("BTC", 90_180.0, 0.80, 60));
        assert_eq!(decision.verdict, Verdict::Duplicate);

        // The stored fingerprint still points at the original signal.
        assert_eq!(ac.fingerprint("BTC").unwrap().price, 90_000.0);
    }

    #[test]
    fn test_duplicate_rules_each_break_the_match() {
        let cfg = AdmissionConfig::default();
        let fp = SignalFingerprint::of(&signal("BTC", 100.0, 0.80, 0));

        assert!(fp.is_duplicate(&signal("BTC", 100.4, 0.85, 200), &cfg));
        assert!(!fp.is_duplicate(&signal("BTC", 100.6, 0.80, 10), &cfg), "price");
        assert!(!fp.is_duplicate(&signal("BTC", 100.0, 0.91, 10), &cfg), "confidence");
        assert!(!fp.is_duplicate(&signal("BTC", 100.0, 0.80, 300), &cfg), "window");

        let mut other_reason = signal("BTC", 100.0, 0.80, 10);
        other_reason.reason = "BB_LOWER".into();
        assert!(!fp.is_duplicate(&other_reason, &cfg), "reason");

        let mut flipped = signal("BTC", 100.0, 0.80, 10);
        flipped.action = SignalAction::Sell;
        assert!(!fp.is_duplicate(&flipped, &cfg), "action");
    }

    #[test]
    fn test_fourth_signal_in_window_is_rate_limited() {
        let (ac, _clock) = controller();
        for (i, secs) in [0, 10, 20].iter().enumerate() {
            let price = 3_000.0 * (1.0 + 0.01 * i as f64);
            assert!(ac.admit(&signal("ETH", price, 0.8, *secs)).is_admitted());
        }
        let decision = ac.admit(&signal("ETH", 3_200.0, 0.8, 45));
        assert_eq!(decision.verdict, Verdict::RateLimited);
        assert_eq!(decision.retry_after, Some(Duration::seconds(15)));

        // Window slides: at t=60 the t=0 admission has aged out.
        assert!(ac.admit(&signal("ETH", 3_300.0, 0.8, 60)).is_admitted());
        // Other symbols are unaffected.
        assert!(ac.admit(&signal("BTC", 90_000.0, 0.8, 45)).is_admitted());
    }

    #[test]
    fn test_symbol_order_cooldown() {
        let (ac, clock) = controller();
        assert!(ac.admit(&signal("SOL", 150.0, 0.8, 0)).is_admitted());
        ac.claim_order_slot("SOL").unwrap();

        clock.advance(Duration::seconds(120));
        let decision = ac.admit(&signal("SOL", 160.0, 0.8, 120));
        assert_eq!(decision.verdict, Verdict::Cooldown);
        assert_eq!(decision.retry_after, Some(Duration::seconds(480)));

        clock.advance(Duration::seconds(480));
        assert!(ac.admit(&signal("SOL", 170.0, 0.8, 600)).is_admitted());
    }

    #[test]
    fn test_global_interval_spans_symbols_and_most_restrictive_wins() {
        let (ac, clock) = controller();
        ac.claim_order_slot("BTC").unwrap();

        clock.advance(Duration::seconds(10));
        let decision = ac.admit(&signal("ETH", 3_000.0, 0.8, 10));
        assert_eq!(decision.verdict, Verdict::Cooldown);
        assert_eq!(decision.retry_after, Some(Duration::seconds(20)));
        assert!(ac.claim_order_slot("ETH").is_err());

        // BTC: symbol cooldown (590s) outranks global (20s)
        let decision = ac.admit(&signal("BTC", 90_000.0, 0.8, 10));
        assert_eq!(decision.retry_after, Some(Duration::seconds(590)));

        clock.advance(Duration::seconds(20));
        assert!(ac.claim_order_slot("ETH").is_ok());
    }

    #[test]
    fn test_released_slot_restores_previous_state() {
        let (ac, clock) = controller();
        ac.claim_order_slot("BTC").unwrap();

        clock.advance(Duration::seconds(700));
        let slot = ac.claim_order_slot("BTC").unwrap();
        ac.release_order_slot("BTC", slot);

        // Back to the first claim: global clear (700s > 30s), symbol clear (700s > 600s)
        assert!(ac.admit(&signal("BTC", 90_000.0, 0.8, 700)).is_admitted());
        assert!(ac.claim_order_slot("ETH").is_ok());
    }

    #[test]
    fn test_release_does_not_clobber_newer_claim() {
        let (ac, clock) = controller();
        let stale = ac.claim_order_slot("BTC").unwrap();
        clock.advance(Duration::seconds(30));
        ac.claim_order_slot("ETH").unwrap();

        ac.release_order_slot("BTC", stale);
        assert!(ac.claim_order_slot("SOL").is_err(), "ETH claim must survive");
    }

    #[test]
    fn test_concurrent_claims_only_one_wins() {
        let (ac, _clock) = controller();
        let symbols = ["BTC", "ETH", "SOL", "DOGE", "AVAX", "ARB"];
        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = symbols
                .iter()
                .map(|s| {
                    let ac = &ac;
                    scope.spawn(move || ac.claim_order_slot(s).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_stats_count_each_verdict() {
        let (ac, _clock) = controller();
        ac.admit(&signal("BTC", 100.0, 0.8, 0));
        ac.admit(&signal("BTC", 100.0, 0.8, 1));
        ac.admit(&signal("ETH", 100.0, 0.8, 0));

        let stats = ac.stats();
        assert_eq!(stats.per_symbol["BTC"].admitted, 1);
        assert_eq!(stats.per_symbol["BTC"].duplicate, 1);
        assert_eq!(stats.overall.admitted, 2);
        assert_eq!(stats.overall.total(), 3);
    }

    proptest! {
        /// At most 3 admissions for a symbol inside any rolling 60s window.
        #[test]
        fn rate_limit_holds_for_any_arrival_pattern(gaps in prop::collection::vec(0i64..40, 1..60)) {
            let (ac, _clock) = controller();
            let mut secs = 0;
            let mut admitted = Vec::new();
            for (i, gap) in gaps.iter().enumerate() {
                secs += gap;
                // 1% price steps so nothing is a duplicate
                let price = 100.0 * 1.01f64.powi(i as i32);
                if ac.admit(&signal("ETH", price, 0.8, secs)).is_admitted() {
                    admitted.push(secs);
                }
            }
            for w in admitted.windows(4) {
                prop_assert!(w[3] - w[0] >= 60, "4 admissions within 60s: {:?}", w);
            }
        }

        /// Two signals matching on action, reason, price and confidence inside
        /// the dedup window are never both admitted.
        #[test]
        fn duplicates_never_both_admitted(
            gap in 0i64..300,
            price_bp in -49i64..49,
            conf_delta in -0.099..0.099_f64,
        ) {
            let (ac, _clock) = controller();
            let first = signal("BTC", 90_000.0, 0.8, 0);
            let second = signal(
                "BTC",
                90_000.0 * (1.0 + price_bp as f64 / 10_000.0),
                0.8 + conf_delta,
                gap,
            );
            let a = ac.admit(&first).is_admitted();
            let b = ac.admit(&second).is_admitted();
            prop_assert!(a);
            prop_assert!(!b);
        }

        /// Successful claims across all symbols are at least 30s apart.
        #[test]
        fn claims_respect_global_interval(
            steps in prop::collection::vec((0i64..45, 0usize..4), 1..40)
        ) {
            let (ac, clock) = controller();
            let symbols = ["BTC", "ETH", "SOL", "AVAX"];
            let mut claimed = Vec::new();
            let mut secs = 0;
            for (gap, sym) in steps {
                secs += gap;
                clock.set(t0() + Duration::seconds(secs));
                if ac.claim_order_slot(symbols[sym]).is_ok() {
                    claimed.push(secs);
                }
            }
            for pair in claimed.windows(2) {
                prop_assert!(pair[1] - pair[0] >= 30);
            }
        }
    }
}
