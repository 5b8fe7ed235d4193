//! Order-admission pipeline
//!
//! signal -> quality gate -> execution readiness -> admission -> order slot ->
//! execution client -> exchange. Every signal gets exactly one verdict. Calls
//! for the same symbol are serialized; different symbols run concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use agent_core::{SharedClock, SignalAction, TradingSignal, Verdict};
use anyhow::{Context, Result};
use chrono::Duration;
use dashmap::DashMap;
use exchange_trait::{ExchangeClient, OrderRequest, OrderSide};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use strategy_selector::{PortfolioSnapshot, Selection, StrategyCandidate, StrategySelector};

use crate::admission::SignalAdmissionController;
use crate::config::AgentConfig;
use crate::metrics::AgentMetrics;
use crate::notifier::{Alert, AlertNotifier};
use crate::quality_gate::{QualityRejection, SignalQualityGate};
use crate::stats::{PipelineStats, SymbolStats, VerdictCounts, VerdictLedger};
use crate::trade_executor::{ExecutionClient, SubmitOutcome, SubmitReport};
use crate::types::{EmergencyStop, MarketContext};

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub symbol: String,
    pub verdict: Verdict,
    pub detail: String,
    pub retry_after: Option<Duration>,
    /// Gate-adjusted confidence, when scoring ran
    pub confidence: Option<f64>,
    pub order: Option<OrderRequest>,
    pub submission: Option<SubmitReport>,
}

impl PipelineOutcome {
    fn rejected(signal: &TradingSignal, verdict: Verdict, detail: String) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            verdict,
            detail,
            retry_after: None,
            confidence: None,
            order: None,
            submission: None,
        }
    }

    pub fn filled(&self) -> bool {
        self.submission.as_ref().is_some_and(SubmitReport::filled)
    }
}

struct ActiveStrategy {
    candidates: Vec<StrategyCandidate>,
    portfolio: PortfolioSnapshot,
    selection: Selection,
    /// Untested strategy already alerted on
    alerted_untested: Option<String>,
}

pub struct Pipeline {
    gate: SignalQualityGate,
    admission: SignalAdmissionController,
    selector: StrategySelector,
    executor: ExecutionClient,
    clock: SharedClock,
    // Verdicts decided outside the admission controller
    ledger: VerdictLedger,
    symbol_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    active: RwLock<ActiveStrategy>,
    notifier: Option<Arc<AlertNotifier>>,
    metrics: Mutex<AgentMetrics>,

    default_expected_move_pct: f64,
    fee_rate: f64,
    min_fee: f64,
    size_decimals: u32,
}

impl Pipeline {
    pub fn new(
        config: &AgentConfig,
        exchange: Arc<dyn ExchangeClient>,
        clock: SharedClock,
        stop: EmergencyStop,
        notifier: Option<Arc<AlertNotifier>>,
    ) -> Result<Self> {
        let selector =
            StrategySelector::new(config.selector.clone()).context("strategy selector config")?;
        let portfolio = PortfolioSnapshot {
            equity: config.portfolio_equity,
            peak_equity: config.portfolio_peak_equity,
            available_margin: config.portfolio_equity,
        };
        let selection = selector.select(&[], &portfolio);

        Ok(Self {
            gate: SignalQualityGate::new(config.quality.clone()),
            admission: SignalAdmissionController::new(config.admission.clone(), clock.clone()),
            executor: ExecutionClient::new(exchange, config.execution.clone(), clock.clone(), stop),
            clock,
            selector,
            ledger: VerdictLedger::new(),
            symbol_locks: DashMap::new(),
            active: RwLock::new(ActiveStrategy {
                candidates: Vec::new(),
                portfolio,
                selection,
                alerted_untested: None,
            }),
            notifier,
            metrics: Mutex::new(AgentMetrics::new(config.metrics_log_interval_signals)),
            default_expected_move_pct: config.default_expected_move_pct,
            fee_rate: config.taker_fee_rate,
            min_fee: config.min_fee_per_order,
            size_decimals: config.execution.size_decimals,
        })
    }

    /// Re-run strategy selection over fresh backtest metrics and account state.
    pub fn update_strategies(
        &self,
        candidates: Vec<StrategyCandidate>,
        portfolio: PortfolioSnapshot,
    ) -> Selection {
        let selection = self.selector.select(&candidates, &portfolio);
        let newly_untested = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            let alerted = (!selection.tested).then(|| selection.strategy.clone());
            let newly_untested = alerted.is_some() && alerted != active.alerted_untested;
            *active = ActiveStrategy {
                candidates,
                portfolio,
                selection: selection.clone(),
                alerted_untested: alerted,
            };
            newly_untested
        };
        // Once per switch to an untested strategy, not on every refresh
        if newly_untested {
            self.alert(Alert::UntestedStrategy {
                strategy: selection.strategy.clone(),
                size_multiplier: selection.size_multiplier,
            });
        }
        selection
    }

    pub fn update_portfolio(&self, portfolio: PortfolioSnapshot) -> Selection {
        let candidates = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .candidates
            .clone();
        self.update_strategies(candidates, portfolio)
    }

    pub fn selection(&self) -> Selection {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .selection
            .clone()
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub async fn process(
        &self,
        signal: &TradingSignal,
        context: Option<MarketContext>,
    ) -> PipelineOutcome {
        let lock = self.symbol_lock(&signal.symbol);
        let _guard = lock.lock().await;

        let started = AgentMetrics::start_timer();
        let outcome = self.run(signal, context).await;

        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.record_verdict(outcome.verdict);
            if let Some(report) = &outcome.submission {
                metrics.record_submission(&report.outcome);
            }
            metrics.finish_signal(started);
        }
        outcome
    }

    async fn run(&self, signal: &TradingSignal, context: Option<MarketContext>) -> PipelineOutcome {
        let symbol = signal.symbol.as_str();

        // 1. Size the order from the active strategy
        let sizing = {
            let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
            self.selector
                .position_size(&active.selection, &active.portfolio, signal.price)
        };
        let notional = sizing.as_ref().map(|s| s.notional).unwrap_or(0.0);

        let mut ctx = context.unwrap_or_else(|| MarketContext {
            min_fee: self.min_fee,
            ..MarketContext::new(self.default_expected_move_pct, self.fee_rate)
        });
        if ctx.notional <= 0.0 {
            ctx = ctx.with_notional(notional);
        }

        // 2. Quality gate
        let gate_timer = AgentMetrics::start_timer();
        let assessment = self.gate.evaluate(signal, &ctx);
        self.record_gate_timing(gate_timer);
        if let Some(rejection) = &assessment.rejection {
            let verdict = rejection.verdict();
            self.ledger.record(symbol, verdict);
            tracing::debug!(symbol, %verdict, "Quality gate rejected: {}", rejection.detail());
            let mut outcome = PipelineOutcome::rejected(signal, verdict, rejection.detail());
            outcome.confidence = Some(assessment.confidence);
            if let QualityRejection::Cooldown { remaining, .. } = rejection {
                outcome.retry_after = *remaining;
            }
            return outcome;
        }

        let Some(order) = self.build_order(signal, sizing.ok().map(|s| s.quantity)) else {
            self.ledger.record(symbol, Verdict::Invalid);
            return PipelineOutcome::rejected(
                signal,
                Verdict::Invalid,
                format!("{} is not an order action", signal.action),
            );
        };
        // An unsendable order must not consume dedup or rate-limit state.
        if let Err(e) = order.validate() {
            tracing::warn!(symbol, "Dropping signal with unsendable order: {}", e);
            self.ledger.record(symbol, Verdict::Invalid);
            let mut outcome = PipelineOutcome::rejected(signal, Verdict::Invalid, e.to_string());
            outcome.confidence = Some(assessment.confidence);
            return outcome;
        }

        // 3. Execution backoff counts as a cooldown; most restrictive wins
        let phase = self.executor.phase(symbol);
        if !phase.is_ready() {
            self.ledger.record(symbol, Verdict::Cooldown);
            let mut outcome = PipelineOutcome::rejected(
                signal,
                Verdict::Cooldown,
                format!("execution {:?} for {}", phase.phase, symbol),
            );
            outcome.retry_after = phase.remaining(self.clock.now());
            outcome.confidence = Some(assessment.confidence);
            return outcome;
        }

        // 4. Admission
        let admission_timer = AgentMetrics::start_timer();
        let decision = self.admission.admit(signal);
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_admission_duration(admission_timer);
        if !decision.is_admitted() {
            return PipelineOutcome {
                symbol: symbol.to_string(),
                verdict: decision.verdict,
                detail: decision.detail,
                retry_after: decision.retry_after,
                confidence: Some(assessment.confidence),
                order: None,
                submission: None,
            };
        }

        let mut outcome = PipelineOutcome {
            symbol: symbol.to_string(),
            verdict: Verdict::Admitted,
            detail: decision.detail,
            retry_after: None,
            confidence: Some(assessment.confidence),
            order: Some(order.clone()),
            submission: None,
        };

        // 5. Claim the global order slot
        let slot = match self.admission.claim_order_slot(symbol) {
            Ok(slot) => slot,
            Err(blocked) => {
                tracing::warn!(symbol, "Admitted signal lost the order slot: {}", blocked.detail);
                outcome.detail = format!("admitted, not sent: {}", blocked.detail);
                outcome.retry_after = blocked.retry_after;
                return outcome;
            }
        };

        // 6. Submit
        let exec_timer = AgentMetrics::start_timer();
        let report = self.executor.submit(&order).await;
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_execution_duration(exec_timer);
        if report.was_sent() {
            self.gate.record_entry(signal);
        } else {
            self.admission.release_order_slot(symbol, slot);
        }

        if report.critical_fill_rate {
            self.alert(Alert::CriticalFillRate {
                symbol: symbol.to_string(),
                fill_rate: report.fill_rate.unwrap_or(0.0),
            });
        }
        if report.outcome == (SubmitOutcome::Failed { fatal: true }) {
            self.alert(Alert::FatalExchangeError {
                symbol: symbol.to_string(),
                error: report.error.clone().unwrap_or_default(),
            });
        }

        outcome.submission = Some(report);
        outcome
    }

    fn build_order(&self, signal: &TradingSignal, quantity: Option<f64>) -> Option<OrderRequest> {
        let side = match signal.action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell => OrderSide::Sell,
            SignalAction::Hold => return None,
        };
        // Unrepresentable sizes become zero and fail order validation.
        let size = quantity
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO)
            .round_dp_with_strategy(self.size_decimals, RoundingStrategy::ToZero);
        let price = Decimal::from_f64(signal.price).unwrap_or(Decimal::ZERO);
        Some(OrderRequest::limit(signal.symbol.clone(), side, size, price))
    }

    fn record_gate_timing(&self, started: std::time::Instant) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_gate_duration(started);
    }

    fn alert(&self, alert: Alert) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_alert();
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        if !notifier.is_enabled() {
            return;
        }
        tokio::spawn(async move { notifier.alert(&alert).await });
    }

    /// Per-symbol and aggregate verdict counts plus execution state. Read-only
    /// and never waits on an in-flight submission.
    pub fn stats(&self) -> PipelineStats {
        let admission = self.admission.stats();
        let local = self.ledger.snapshot();

        let symbols: BTreeSet<String> = admission
            .per_symbol
            .keys()
            .chain(local.keys())
            .cloned()
            .chain(self.executor.known_symbols())
            .collect();

        let mut per_symbol = BTreeMap::new();
        let mut overall = VerdictCounts::default();
        for symbol in symbols {
            let mut verdicts = admission.per_symbol.get(&symbol).copied().unwrap_or_default();
            verdicts += local.get(&symbol).copied().unwrap_or_default();
            overall += verdicts;
            let execution = self.executor.get_anti_churn_stats(&symbol);
            per_symbol.insert(symbol, SymbolStats { verdicts, execution });
        }

        PipelineStats {
            symbols: per_symbol,
            overall,
        }
    }

    pub fn metrics_json(&self) -> serde_json::Value {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_json()
    }

    pub fn log_metrics(&self) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log_metrics();
    }
}
