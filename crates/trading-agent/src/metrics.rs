use std::collections::VecDeque;
use std::time::Instant;

use agent_core::Verdict;

use crate::stats::VerdictCounts;
use crate::trade_executor::SubmitOutcome;

const RECENT_WINDOW: usize = 20;

/// Pipeline telemetry: per-stage timing, verdict and order totals, and a
/// rolling fill window across all symbols.
pub struct AgentMetrics {
    pub signals_processed: u64,
    pub verdicts: VerdictCounts,

    pub orders_filled: u64,
    pub orders_accepted: u64,
    pub orders_failed: u64,
    pub orders_fatal: u64,
    pub orders_rejected: u64,
    pub orders_throttled: u64,
    pub orders_cancelled: u64,
    pub alerts_raised: u64,

    // Per-signal timing (last signal)
    pub last_gate_duration_ms: u64,
    pub last_admission_duration_ms: u64,
    pub last_execution_duration_ms: u64,
    pub last_total_duration_ms: u64,

    // Rolling 20-submission window
    recent_submissions: VecDeque<bool>,
    log_interval_signals: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_signals: u64) -> Self {
        Self {
            signals_processed: 0,
            verdicts: VerdictCounts::default(),
            orders_filled: 0,
            orders_accepted: 0,
            orders_failed: 0,
            orders_fatal: 0,
            orders_rejected: 0,
            orders_throttled: 0,
            orders_cancelled: 0,
            alerts_raised: 0,
            last_gate_duration_ms: 0,
            last_admission_duration_ms: 0,
            last_execution_duration_ms: 0,
            last_total_duration_ms: 0,
            recent_submissions: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_signals,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_gate_duration(&mut self, start: Instant) {
        self.last_gate_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_admission_duration(&mut self, start: Instant) {
        self.last_admission_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_execution_duration(&mut self, start: Instant) {
        self.last_execution_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_verdict(&mut self, verdict: Verdict) {
        self.verdicts.increment(verdict);
    }

    pub fn record_submission(&mut self, outcome: &SubmitOutcome) {
        let sent = match outcome {
            SubmitOutcome::Filled => {
                self.orders_filled += 1;
                Some(true)
            }
            SubmitOutcome::Accepted => {
                self.orders_accepted += 1;
                Some(false)
            }
            SubmitOutcome::Failed { fatal } => {
                self.orders_failed += 1;
                if *fatal {
                    self.orders_fatal += 1;
                }
                Some(false)
            }
            SubmitOutcome::Rejected => {
                self.orders_rejected += 1;
                None
            }
            SubmitOutcome::Throttled { .. } => {
                self.orders_throttled += 1;
                None
            }
            SubmitOutcome::Cancelled => {
                self.orders_cancelled += 1;
                None
            }
        };

        if let Some(filled) = sent {
            self.recent_submissions.push_back(filled);
            if self.recent_submissions.len() > RECENT_WINDOW {
                self.recent_submissions.pop_front();
            }
        }
    }

    pub fn record_alert(&mut self) {
        self.alerts_raised += 1;
    }

    pub fn finish_signal(&mut self, start: Instant) {
        self.last_total_duration_ms = start.elapsed().as_millis() as u64;
        self.signals_processed += 1;

        if self.log_interval_signals > 0
            && self.signals_processed % self.log_interval_signals == 0
        {
            self.log_metrics();
        }
    }

    /// Fill rate over the last 20 submissions that reached the exchange (0-100%)
    pub fn recent_fill_rate(&self) -> f64 {
        if self.recent_submissions.is_empty() {
            return 0.0;
        }
        let filled = self.recent_submissions.iter().filter(|f| **f).count() as f64;
        (filled / self.recent_submissions.len() as f64) * 100.0
    }

    pub fn orders_sent(&self) -> u64 {
        self.orders_filled + self.orders_accepted + self.orders_failed
    }

    /// Orders sent per order filled
    pub fn churn_ratio(&self) -> Option<f64> {
        (self.orders_filled > 0).then(|| self.orders_sent() as f64 / self.orders_filled as f64)
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            signals = self.signals_processed,
            admitted = self.verdicts.admitted,
            duplicate = self.verdicts.duplicate,
            rate_limited = self.verdicts.rate_limited,
            cooldown = self.verdicts.cooldown,
            low_confidence = self.verdicts.low_confidence,
            low_edge = self.verdicts.low_edge,
            invalid = self.verdicts.invalid,
            orders_filled = self.orders_filled,
            orders_accepted = self.orders_accepted,
            orders_failed = self.orders_failed,
            orders_throttled = self.orders_throttled,
            orders_cancelled = self.orders_cancelled,
            recent_fill_rate = format!("{:.1}%", self.recent_fill_rate()),
            last_signal_ms = self.last_total_duration_ms,
            last_execution_ms = self.last_execution_duration_ms,
            "Pipeline metrics summary"
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "signals_processed": self.signals_processed,
            "verdicts": self.verdicts,
            "orders_filled": self.orders_filled,
            "orders_accepted": self.orders_accepted,
            "orders_failed": self.orders_failed,
            "orders_fatal": self.orders_fatal,
            "orders_rejected": self.orders_rejected,
            "orders_throttled": self.orders_throttled,
            "orders_cancelled": self.orders_cancelled,
            "alerts_raised": self.alerts_raised,
            "recent_fill_rate": self.recent_fill_rate(),
            "churn_ratio": self.churn_ratio(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_fill_window() {
        let mut m = AgentMetrics::new(0);
        for _ in 0..20 {
            m.record_submission(&SubmitOutcome::Accepted);
        }
        for _ in 0..5 {
            m.record_submission(&SubmitOutcome::Filled);
        }
        // Only the last 20 count: 15 unfilled, 5 filled
        assert!((m.recent_fill_rate() - 25.0).abs() < 1e-9);
        assert_eq!(m.orders_sent(), 25);
        assert_eq!(m.churn_ratio(), Some(5.0));
    }

    #[test]
    fn test_unsent_outcomes_skip_fill_window() {
        let mut m = AgentMetrics::new(0);
        m.record_submission(&SubmitOutcome::Cancelled);
        m.record_submission(&SubmitOutcome::Rejected);
        m.record_submission(&SubmitOutcome::Failed { fatal: true });
        assert_eq!(m.orders_cancelled, 1);
        assert_eq!(m.orders_fatal, 1);
        assert_eq!(m.recent_fill_rate(), 0.0);
        assert_eq!(m.churn_ratio(), None);
        assert_eq!(m.to_json()["orders_failed"], 1);
    }

    #[test]
    fn test_finish_signal_counts() {
        let mut m = AgentMetrics::new(2);
        m.record_verdict(Verdict::LowEdge);
        m.finish_signal(AgentMetrics::start_timer());
        m.finish_signal(AgentMetrics::start_timer());
        assert_eq!(m.signals_processed, 2);
        assert_eq!(m.to_json()["verdicts"]["low_edge"], 1);
    }
}
