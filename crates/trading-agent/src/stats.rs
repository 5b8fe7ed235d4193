use std::collections::BTreeMap;
use std::ops::AddAssign;

use agent_core::Verdict;
use dashmap::DashMap;
use serde::Serialize;

use crate::trade_executor::AntiChurnStats;

/// Count of each verdict for one symbol, or across all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub admitted: u64,
    pub duplicate: u64,
    pub rate_limited: u64,
    pub cooldown: u64,
    pub low_confidence: u64,
    pub low_edge: u64,
    pub invalid: u64,
}

impl VerdictCounts {
    fn slot(&mut self, verdict: Verdict) -> &mut u64 {
        match verdict {
            Verdict::Admitted => &mut self.admitted,
            Verdict::Duplicate => &mut self.duplicate,
            Verdict::RateLimited => &mut self.rate_limited,
            Verdict::Cooldown => &mut self.cooldown,
            Verdict::LowConfidence => &mut self.low_confidence,
            Verdict::LowEdge => &mut self.low_edge,
            Verdict::Invalid => &mut self.invalid,
        }
    }

    pub fn increment(&mut self, verdict: Verdict) {
        *self.slot(verdict) += 1;
    }

    pub fn get(&self, verdict: Verdict) -> u64 {
        match verdict {
            Verdict::Admitted => self.admitted,
            Verdict::Duplicate => self.duplicate,
            Verdict::RateLimited => self.rate_limited,
            Verdict::Cooldown => self.cooldown,
            Verdict::LowConfidence => self.low_confidence,
            Verdict::LowEdge => self.low_edge,
            Verdict::Invalid => self.invalid,
        }
    }

    pub fn total(&self) -> u64 {
        Verdict::ALL.iter().map(|v| self.get(*v)).sum()
    }
}

impl AddAssign for VerdictCounts {
    fn add_assign(&mut self, other: Self) {
        for verdict in Verdict::ALL {
            *self.slot(verdict) += other.get(verdict);
        }
    }
}

/// Per-symbol verdict counters, safe to update from concurrent symbol workers.
#[derive(Debug, Default)]
pub struct VerdictLedger {
    per_symbol: DashMap<String, VerdictCounts>,
}

impl VerdictLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &str, verdict: Verdict) {
        self.per_symbol
            .entry(symbol.to_string())
            .or_default()
            .increment(verdict);
    }

    pub fn snapshot(&self) -> BTreeMap<String, VerdictCounts> {
        self.per_symbol
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub per_symbol: BTreeMap<String, VerdictCounts>,
    pub overall: VerdictCounts,
}

impl AdmissionStats {
    pub fn from_per_symbol(per_symbol: BTreeMap<String, VerdictCounts>) -> Self {
        let mut overall = VerdictCounts::default();
        for counts in per_symbol.values() {
            overall += *counts;
        }
        Self {
            per_symbol,
            overall,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStats {
    pub verdicts: VerdictCounts,
    pub execution: AntiChurnStats,
}

/// Read-only monitoring view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub symbols: BTreeMap<String, SymbolStats>,
    pub overall: VerdictCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_counts_per_symbol() {
        let ledger = VerdictLedger::new();
        ledger.record("BTC", Verdict::Admitted);
        ledger.record("BTC", Verdict::Duplicate);
        ledger.record("ETH", Verdict::RateLimited);
        ledger.record("ETH", Verdict::RateLimited);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot["BTC"].admitted, 1);
        assert_eq!(snapshot["BTC"].duplicate, 1);
        assert_eq!(snapshot["ETH"].rate_limited, 2);

        let stats = AdmissionStats::from_per_symbol(snapshot);
        assert_eq!(stats.overall.total(), 4);
        assert_eq!(stats.overall.get(Verdict::RateLimited), 2);
    }

    #[test]
    fn test_counts_add() {
        let mut a = VerdictCounts::default();
        a.increment(Verdict::Cooldown);
        let mut b = VerdictCounts::default();
        b.increment(Verdict::Cooldown);
        b.increment(Verdict::LowEdge);
        a += b;
        assert_eq!(a.cooldown, 2);
        assert_eq!(a.low_edge, 1);
        assert_eq!(a.total(), 3);
    }
}
