//! Strategy quality selection
//!
//! Scores strategy variants from their externally computed backtest metrics,
//! picks the one the agent should size positions for, and turns that choice
//! plus a portfolio snapshot into an order size.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("Invalid selector config: {0}")]
    InvalidConfig(String),

    #[error("Invalid price for sizing: {0}")]
    InvalidPrice(f64),
}

/// A strategy variant with backtest metrics. Immutable once computed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub name: String,
    pub sharpe: f64,
    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,
    /// Max drawdown as a fraction (0.25 = 25%)
    pub max_drawdown: f64,
    /// Total return in percent (12.5 = +12.5%)
    pub total_return: f64,
    pub trade_count: u32,
}

impl StrategyCandidate {
    fn has_finite_metrics(&self) -> bool {
        self.sharpe.is_finite()
            && self.win_rate.is_finite()
            && self.max_drawdown.is_finite()
            && self.total_return.is_finite()
    }
}

/// Account state supplied by the portfolio collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub equity: f64,
    pub peak_equity: f64,
    pub available_margin: f64,
}

impl PortfolioSnapshot {
    /// Drawdown from peak as a fraction (0.0 when at or above peak).
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 || self.equity >= self.peak_equity {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    // Hard filters
    pub min_sharpe: f64,
    pub min_win_rate: f64,
    pub max_drawdown: f64,
    pub min_trade_count: u32,
    pub min_total_return: f64,

    // Score weights (must sum to 1.0)
    pub return_weight: f64,
    pub sharpe_weight: f64,
    pub win_rate_weight: f64,
    pub drawdown_weight: f64,

    // Normalization ranges
    pub return_floor: f64,
    pub return_ceiling: f64,
    pub sharpe_floor: f64,
    pub sharpe_ceiling: f64,

    /// Cap on the bonus for returns above `return_ceiling`
    pub upside_bonus_cap: f64,

    /// Trade count below which a sample-size penalty applies
    pub min_significant_trades: u32,
    /// Penalty at zero trades; scales linearly with the shortfall
    pub sample_penalty_weight: f64,

    pub fallback_strategy: String,
    pub base_size_multiplier: f64,
    /// Fraction of equity committed at a size multiplier of 1.0
    pub max_position_fraction: f64,
    /// Floor on the drawdown de-risking factor
    pub min_drawdown_multiplier: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_sharpe: -0.3,
            min_win_rate: 0.15,
            max_drawdown: 0.80,
            min_trade_count: 3,
            min_total_return: -10.0,
            return_weight: 0.40,
            sharpe_weight: 0.25,
            win_rate_weight: 0.20,
            drawdown_weight: 0.15,
            return_floor: -10.0,
            return_ceiling: 100.0,
            sharpe_floor: -0.3,
            sharpe_ceiling: 3.0,
            upside_bonus_cap: 0.05,
            min_significant_trades: 20,
            sample_penalty_weight: 0.10,
            fallback_strategy: "conservative_trend".to_string(),
            base_size_multiplier: 1.0,
            max_position_fraction: 0.10,
            min_drawdown_multiplier: 0.25,
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<(), SelectorError> {
        let weight_sum =
            self.return_weight + self.sharpe_weight + self.win_rate_weight + self.drawdown_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(SelectorError::InvalidConfig(format!(
                "score weights must sum to 1.0, got {:.4}",
                weight_sum
            )));
        }
        if self.return_ceiling <= self.return_floor || self.return_ceiling <= 0.0 {
            return Err(SelectorError::InvalidConfig(
                "return_ceiling must be positive and above return_floor".to_string(),
            ));
        }
        if self.sharpe_ceiling <= self.sharpe_floor {
            return Err(SelectorError::InvalidConfig(
                "sharpe_ceiling must be above sharpe_floor".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_position_fraction) || self.max_position_fraction == 0.0
        {
            return Err(SelectorError::InvalidConfig(
                "max_position_fraction must be in (0, 1]".to_string(),
            ));
        }
        if self.base_size_multiplier <= 0.0 {
            return Err(SelectorError::InvalidConfig(
                "base_size_multiplier must be positive".to_string(),
            ));
        }
        if self.fallback_strategy.trim().is_empty() {
            return Err(SelectorError::InvalidConfig(
                "fallback_strategy must be named".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which hard filter excluded a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardFilter {
    Sharpe,
    WinRate,
    Drawdown,
    TradeCount,
    TotalReturn,
    NonFiniteMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: StrategyCandidate,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub strategy: String,
    /// The winning candidate's metrics; `None` for a fallback with no backtest
    pub candidate: Option<StrategyCandidate>,
    pub score: Option<f64>,
    pub size_multiplier: f64,
    /// False when the fallback strategy was chosen
    pub tested: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    pub notional: f64,
    pub quantity: f64,
    pub reasoning: String,
}

pub struct StrategySelector {
    config: SelectorConfig,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self {
            config: SelectorConfig::default(),
        }
    }
}

impl StrategySelector {
    pub fn new(config: SelectorConfig) -> Result<Self, SelectorError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn check_hard_filters(&self, c: &StrategyCandidate) -> Result<(), HardFilter> {
        let cfg = &self.config;
        if !c.has_finite_metrics() {
            return Err(HardFilter::NonFiniteMetrics);
        }
        if c.sharpe < cfg.min_sharpe {
            return Err(HardFilter::Sharpe);
        }
        if c.win_rate < cfg.min_win_rate {
            return Err(HardFilter::WinRate);
        }
        if c.max_drawdown > cfg.max_drawdown {
            return Err(HardFilter::Drawdown);
        }
        if c.trade_count < cfg.min_trade_count {
            return Err(HardFilter::TradeCount);
        }
        if c.total_return < cfg.min_total_return {
            return Err(HardFilter::TotalReturn);
        }
        Ok(())
    }

    /// Weighted quality score. Each term is normalized into [0, 1] first.
    pub fn score(&self, c: &StrategyCandidate) -> f64 {
        let cfg = &self.config;

        let norm_return = normalize(c.total_return, cfg.return_floor, cfg.return_ceiling);
        let norm_sharpe = normalize(c.sharpe, cfg.sharpe_floor, cfg.sharpe_ceiling);
        let win_rate = c.win_rate.clamp(0.0, 1.0);
        let drawdown_term = (1.0 - c.max_drawdown).clamp(0.0, 1.0);

        let weighted = cfg.return_weight * norm_return
            + cfg.sharpe_weight * norm_sharpe
            + cfg.win_rate_weight * win_rate
            + cfg.drawdown_weight * drawdown_term;

        weighted + self.upside_bonus(c.total_return) - self.sample_penalty(c.trade_count)
    }

    /// Returns past the ceiling earn a small bonus instead of more return weight.
    fn upside_bonus(&self, total_return: f64) -> f64 {
        let cfg = &self.config;
        if total_return <= cfg.return_ceiling {
            return 0.0;
        }
        let excess = (total_return - cfg.return_ceiling) / cfg.return_ceiling;
        (excess * cfg.upside_bonus_cap).min(cfg.upside_bonus_cap)
    }

    fn sample_penalty(&self, trade_count: u32) -> f64 {
        let cfg = &self.config;
        if cfg.min_significant_trades == 0 || trade_count >= cfg.min_significant_trades {
            return 0.0;
        }
        let shortfall = (cfg.min_significant_trades - trade_count) as f64
            / cfg.min_significant_trades as f64;
        cfg.sample_penalty_weight * shortfall
    }

    /// Eligible candidates, best first. Ties go to more trades, then higher sharpe.
    pub fn rank(&self, candidates: &[StrategyCandidate]) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .filter(|c| match self.check_hard_filters(c) {
                Ok(()) => true,
                Err(filter) => {
                    tracing::debug!("Strategy {} excluded by {:?} filter", c.name, filter);
                    false
                }
            })
            .map(|c| ScoredCandidate {
                candidate: c.clone(),
                score: self.score(c),
            })
            .collect();

        scored.sort_by(|a, b| compare_ranked(b, a));
        scored
    }

    pub fn select(
        &self,
        candidates: &[StrategyCandidate],
        portfolio: &PortfolioSnapshot,
    ) -> Selection {
        let derisk = self.drawdown_factor(portfolio);
        let ranked = self.rank(candidates);

        match ranked.into_iter().next() {
            Some(best) => {
                let size_multiplier = self.config.base_size_multiplier * derisk;
                tracing::info!(
                    strategy = %best.candidate.name,
                    score = best.score,
                    size_multiplier,
                    "Selected strategy"
                );
                Selection {
                    strategy: best.candidate.name.clone(),
                    reasoning: format!(
                        "score {:.3} (return {:.1}%, sharpe {:.2}, win rate {:.0}%, max DD {:.0}%, {} trades), drawdown factor {:.2}",
                        best.score,
                        best.candidate.total_return,
                        best.candidate.sharpe,
                        best.candidate.win_rate * 100.0,
                        best.candidate.max_drawdown * 100.0,
                        best.candidate.trade_count,
                        derisk
                    ),
                    score: Some(best.score),
                    candidate: Some(best.candidate),
                    size_multiplier,
                    tested: true,
                }
            }
            None => {
                let size_multiplier = self.config.base_size_multiplier * derisk * 0.5;
                tracing::warn!(
                    strategy = %self.config.fallback_strategy,
                    candidates = candidates.len(),
                    "No strategy with sufficient backtest history; using untested fallback at half size"
                );
                Selection {
                    strategy: self.config.fallback_strategy.clone(),
                    candidate: candidates
                        .iter()
                        .find(|c| c.name == self.config.fallback_strategy)
                        .cloned(),
                    score: None,
                    size_multiplier,
                    tested: false,
                    reasoning: format!(
                        "fallback: none of {} candidates passed hard filters",
                        candidates.len()
                    ),
                }
            }
        }
    }

    fn drawdown_factor(&self, portfolio: &PortfolioSnapshot) -> f64 {
        (1.0 - portfolio.drawdown()).clamp(self.config.min_drawdown_multiplier, 1.0)
    }

    /// Order size for a selection: a fixed fraction of equity scaled by the
    /// size multiplier, never more than the available margin.
    pub fn position_size(
        &self,
        selection: &Selection,
        portfolio: &PortfolioSnapshot,
        price: f64,
    ) -> Result<PositionSize, SelectorError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(SelectorError::InvalidPrice(price));
        }

        let target =
            portfolio.equity.max(0.0) * self.config.max_position_fraction * selection.size_multiplier;
        let notional = target.min(portfolio.available_margin.max(0.0));
        let quantity = notional / price;

        Ok(PositionSize {
            notional,
            quantity,
            reasoning: format!(
                "{:.1}% of equity x{:.2} = ${:.2}{}",
                self.config.max_position_fraction * 100.0,
                selection.size_multiplier,
                target,
                if notional < target {
                    format!(", capped by margin at ${:.2}", notional)
                } else {
                    String::new()
                }
            ),
        })
    }
}

fn normalize(value: f64, floor: f64, ceiling: f64) -> f64 {
    ((value - floor) / (ceiling - floor)).clamp(0.0, 1.0)
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.candidate.trade_count.cmp(&b.candidate.trade_count))
        .then_with(|| a.candidate.sharpe.total_cmp(&b.candidate.sharpe))
}
