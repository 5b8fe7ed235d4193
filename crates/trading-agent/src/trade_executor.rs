use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use agent_core::SharedClock;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use exchange_trait::{ExchangeClient, ExchangeError, OrderFill, OrderRequest};
use serde::Serialize;

use crate::config::ExecutionConfig;
use crate::types::EmergencyStop;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    #[default]
    Ready,
    Cooldown,
    ExtendedCooldown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub phase: ExecutionPhase,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PhaseStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == ExecutionPhase::Ready
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|at| at - now)
            .filter(|d| *d > Duration::zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One recorded submission, after retries.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAttempt {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub filled: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub latency_ms: u64,
    pub tries: u32,
    pub error: Option<String>,
}

/// Per-symbol backoff state. Phase is never stored, only derived.
#[derive(Debug, Default)]
struct ExecutionState {
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    history: VecDeque<OrderAttempt>,
}

/// `submitting` serializes submissions for the symbol across the exchange
/// call. `state` is only held for bookkeeping, never across an await.
#[derive(Debug, Default)]
struct SymbolExecution {
    submitting: tokio::sync::Mutex<()>,
    state: Mutex<ExecutionState>,
}

impl SymbolExecution {
    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecutionState {
    /// Filled attempts over the trailing window, with the sample count.
    fn fill_rate(&self, window: usize) -> Option<(f64, usize)> {
        let recent: Vec<_> = self.history.iter().rev().take(window).collect();
        if recent.is_empty() {
            return None;
        }
        let filled = recent.iter().filter(|a| a.filled).count();
        Some((filled as f64 / recent.len() as f64, recent.len()))
    }

    fn fill_rate_critical(&self, cfg: &ExecutionConfig) -> bool {
        matches!(
            self.fill_rate(cfg.fill_rate_window),
            Some((rate, samples)) if samples >= cfg.fill_rate_min_samples && rate < cfg.fill_rate_critical
        )
    }

    fn phase(&self, now: DateTime<Utc>, cfg: &ExecutionConfig) -> PhaseStatus {
        let Some(until) = self.cooldown_until else {
            return PhaseStatus::default();
        };
        if now < until {
            return PhaseStatus {
                phase: ExecutionPhase::Cooldown,
                expires_at: Some(until),
            };
        }

        let extended_until = until + Duration::seconds(cfg.extended_cooldown_secs);
        let needs_extension = self.consecutive_failures >= cfg.failure_streak_threshold
            || self.fill_rate_critical(cfg);
        if needs_extension && now < extended_until {
            PhaseStatus {
                phase: ExecutionPhase::ExtendedCooldown,
                expires_at: Some(extended_until),
            }
        } else {
            PhaseStatus::default()
        }
    }
}

/// Cooldown after a recorded attempt. Base until the failure streak reaches
/// the threshold, then doubling per extra failure, capped.
pub fn cooldown_for(consecutive_failures: u32, cfg: &ExecutionConfig) -> Duration {
    let base = cfg.base_cooldown_secs;
    let cap = cfg.max_backoff_secs;
    if consecutive_failures < cfg.failure_streak_threshold {
        return Duration::seconds(base.min(cap));
    }
    let exponent = (consecutive_failures - cfg.failure_streak_threshold)
        .saturating_add(1)
        .min(30);
    Duration::seconds(base.saturating_mul(1i64 << exponent).min(cap))
}

/// Delay before retry number `retry` (0-based).
pub fn retry_delay(retry: u32, cfg: &ExecutionConfig) -> std::time::Duration {
    let ms = cfg
        .retry_base_delay_ms
        .saturating_mul(1u64 << retry.min(16))
        .min(cfg.retry_max_delay_ms);
    std::time::Duration::from_millis(ms)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Accepted and at least partially filled
    Filled,
    /// Accepted, nothing executed
    Accepted,
    /// Exhausted retries, or failed with a non-transient error
    Failed { fatal: bool },
    /// Failed local validation; never sent
    Rejected,
    /// Symbol is cooling down; never sent
    Throttled {
        phase: ExecutionPhase,
        retry_after: Option<Duration>,
    },
    /// Emergency stop observed before or between tries
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SubmitReport {
    pub symbol: String,
    pub outcome: SubmitOutcome,
    pub fill: Option<OrderFill>,
    pub error: Option<String>,
    pub tries: u32,
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    pub fill_rate: Option<f64>,
    pub critical_fill_rate: bool,
}

impl SubmitReport {
    fn unsent(symbol: &str, outcome: SubmitOutcome, error: Option<String>, tries: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            outcome,
            fill: None,
            error,
            tries,
            latency_ms: 0,
            consecutive_failures: 0,
            fill_rate: None,
            critical_fill_rate: false,
        }
    }

    pub fn filled(&self) -> bool {
        self.outcome == SubmitOutcome::Filled
    }

    /// Whether anything reached the exchange.
    pub fn was_sent(&self) -> bool {
        self.tries > 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AntiChurnStats {
    pub fill_rate: Option<f64>,
    pub attempts_in_window: usize,
    pub consecutive_failures: u32,
    pub phase: ExecutionPhase,
    pub cooldown_expires_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

pub struct ExecutionClient {
    exchange: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    clock: SharedClock,
    stop: EmergencyStop,
    states: DashMap<String, Arc<SymbolExecution>>,
}

impl ExecutionClient {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        clock: SharedClock,
        stop: EmergencyStop,
    ) -> Self {
        tracing::info!(
            "Execution client on {} (paper: {}), base cooldown {}s, backoff cap {}s, {} retries",
            exchange.exchange_name(),
            exchange.is_paper(),
            config.base_cooldown_secs,
            config.max_backoff_secs,
            config.max_retries
        );
        Self {
            exchange,
            config,
            clock,
            stop,
            states: DashMap::new(),
        }
    }

    fn slot_for(&self, symbol: &str) -> Arc<SymbolExecution> {
        self.states
            .entry(symbol.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn existing(&self, symbol: &str) -> Option<Arc<SymbolExecution>> {
        self.states.get(symbol).map(|s| s.value().clone())
    }

    /// Current phase. Never waits on an in-flight submission.
    pub fn phase(&self, symbol: &str) -> PhaseStatus {
        match self.existing(symbol) {
            Some(slot) => slot.state().phase(self.clock.now(), &self.config),
            None => PhaseStatus::default(),
        }
    }

    pub async fn submit(&self, order: &OrderRequest) -> SubmitReport {
        let symbol = order.symbol.as_str();
        let slot = self.slot_for(symbol);
        let _submitting = slot.submitting.lock().await;

        if let Err(e) = order.validate() {
            tracing::warn!(symbol, "Order failed validation: {}", e);
            return SubmitReport::unsent(symbol, SubmitOutcome::Rejected, Some(e.to_string()), 0);
        }

        let now = self.clock.now();
        let status = slot.state().phase(now, &self.config);
        if !status.is_ready() {
            tracing::debug!(symbol, phase = ?status.phase, "Submission throttled");
            return SubmitReport::unsent(
                symbol,
                SubmitOutcome::Throttled {
                    phase: status.phase,
                    retry_after: status.remaining(now),
                },
                None,
                0,
            );
        }

        let started = Instant::now();
        let mut tries = 0u32;
        let result: Result<OrderFill, ExchangeError> = loop {
            if self.stop.is_triggered() {
                return self.cancelled(symbol, tries);
            }
            tries += 1;
            match self.exchange.submit_order(order).await {
                Ok(fill) => break Ok(fill),
                Err(e) if e.is_transient() && tries <= self.config.max_retries => {
                    let delay = retry_delay(tries - 1, &self.config);
                    tracing::warn!(
                        symbol,
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        "Transient order failure, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.triggered() => return self.cancelled(symbol, tries),
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let now = self.clock.now();
        let mut state = slot.state();
        let (outcome, fill, error) = match result {
            Ok(fill) => {
                state.consecutive_failures = 0;
                state.last_success_at = Some(now);
                let outcome = if fill.is_filled() {
                    SubmitOutcome::Filled
                } else {
                    SubmitOutcome::Accepted
                };
                (outcome, Some(fill), None)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                let fatal = !e.is_transient();
                (SubmitOutcome::Failed { fatal }, None, Some(e.to_string()))
            }
        };

        let cooldown = cooldown_for(state.consecutive_failures, &self.config);
        state.cooldown_until = Some(now + cooldown);

        let attempt = OrderAttempt {
            symbol: symbol.to_string(),
            timestamp: now,
            outcome: if matches!(outcome, SubmitOutcome::Failed { .. }) {
                AttemptOutcome::Failure
            } else {
                AttemptOutcome::Success
            },
            filled: outcome == SubmitOutcome::Filled,
            consecutive_failures: state.consecutive_failures,
            last_success_at: state.last_success_at,
            latency_ms,
            tries,
            error: error.clone(),
        };
        state.history.push_back(attempt);
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }

        let fill_rate = state.fill_rate(self.config.fill_rate_window);
        let critical = state.fill_rate_critical(&self.config);
        let consecutive_failures = state.consecutive_failures;
        drop(state);
        self.log_fill_rate(symbol, fill_rate, critical);

        match &outcome {
            SubmitOutcome::Failed { fatal: true } => tracing::error!(
                symbol,
                consecutive_failures,
                "Order failed (fatal): {}",
                error.as_deref().unwrap_or_default()
            ),
            SubmitOutcome::Failed { fatal: false } => tracing::warn!(
                symbol,
                consecutive_failures,
                cooldown_secs = cooldown.num_seconds(),
                "Order failed after {} tries: {}",
                tries,
                error.as_deref().unwrap_or_default()
            ),
            _ => tracing::info!(
                symbol,
                outcome = ?outcome,
                latency_ms,
                cooldown_secs = cooldown.num_seconds(),
                "Order submitted"
            ),
        }

        SubmitReport {
            symbol: symbol.to_string(),
            outcome,
            fill,
            error,
            tries,
            latency_ms,
            consecutive_failures,
            fill_rate: fill_rate.map(|(rate, _)| rate),
            critical_fill_rate: critical,
        }
    }

    fn cancelled(&self, symbol: &str, tries: u32) -> SubmitReport {
        tracing::warn!(symbol, tries, "Submission cancelled by emergency stop");
        SubmitReport::unsent(symbol, SubmitOutcome::Cancelled, None, tries)
    }

    fn log_fill_rate(&self, symbol: &str, fill_rate: Option<(f64, usize)>, critical: bool) {
        let Some((rate, samples)) = fill_rate else {
            return;
        };
        if samples < self.config.fill_rate_min_samples {
            return;
        }
        if critical {
            tracing::error!(
                symbol,
                fill_rate = rate,
                samples,
                "CRITICAL fill rate, forcing extended cooldown"
            );
        } else if rate < self.config.fill_rate_warning {
            tracing::warn!(symbol, fill_rate = rate, samples, "Low fill rate");
        }
    }

    /// Read-only snapshot. Never waits on an in-flight submission.
    pub fn get_anti_churn_stats(&self, symbol: &str) -> AntiChurnStats {
        let Some(slot) = self.existing(symbol) else {
            return AntiChurnStats::default();
        };
        let state = slot.state();
        let status = state.phase(self.clock.now(), &self.config);
        let fill_rate = state.fill_rate(self.config.fill_rate_window);
        AntiChurnStats {
            fill_rate: fill_rate.map(|(rate, _)| rate),
            attempts_in_window: fill_rate.map(|(_, n)| n).unwrap_or(0),
            consecutive_failures: state.consecutive_failures,
            phase: status.phase,
            cooldown_expires_at: status.expires_at,
            last_success_at: state.last_success_at,
        }
    }

    pub fn history(&self, symbol: &str) -> Vec<OrderAttempt> {
        match self.existing(symbol) {
            Some(slot) => slot.state().history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn known_symbols(&self) -> Vec<String> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }
}
