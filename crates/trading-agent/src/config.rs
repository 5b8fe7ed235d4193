use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use strategy_selector::SelectorConfig;

/// Signal-quality thresholds and confidence adjustments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateConfig {
    // Minimum confidence per signal category
    pub extreme_rsi_min_confidence: f64, // 0.80
    pub moderate_rsi_min_confidence: f64, // 0.75
    pub band_touch_min_confidence: f64,  // 0.72
    pub default_min_confidence: f64,     // 0.75

    // Confidence adjustments
    pub rsi_boost_weight: f64,
    pub macd_alignment_boost: f64,
    pub volume_confirmation_ratio: f64,
    pub volume_boost: f64,
    pub counter_trend_penalty: f64,
    pub low_volatility_boost: f64,
    pub high_volatility_penalty: f64,

    /// Expected move must exceed this multiple of the round-trip fee
    pub edge_fee_multiple: f64, // 1.5

    // Signal-level cooldowns
    pub fresh_entry_cooldown_secs: i64,  // 5
    pub reentry_cooldown_secs: i64,      // 10
    pub reentry_min_price_move: f64,     // 0.001 (0.1%)
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            extreme_rsi_min_confidence: 0.80,
            moderate_rsi_min_confidence: 0.75,
            band_touch_min_confidence: 0.72,
            default_min_confidence: 0.75,
            rsi_boost_weight: 0.10,
            macd_alignment_boost: 0.05,
            volume_confirmation_ratio: 1.5,
            volume_boost: 0.05,
            counter_trend_penalty: 0.10,
            low_volatility_boost: 0.03,
            high_volatility_penalty: 0.05,
            edge_fee_multiple: 1.5,
            fresh_entry_cooldown_secs: 5,
            reentry_cooldown_secs: 10,
            reentry_min_price_move: 0.001,
        }
    }
}

/// Deduplication, rate limiting and order-level cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub dedup_window_secs: i64,          // 300
    pub dedup_price_tolerance: f64,      // 0.005 (0.5%)
    pub dedup_confidence_tolerance: f64, // 0.10
    pub rate_limit_max_signals: usize,   // 3
    pub rate_limit_window_secs: i64,     // 60
    pub symbol_order_cooldown_secs: i64, // 600
    pub global_order_interval_secs: i64, // 30
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            dedup_price_tolerance: 0.005,
            dedup_confidence_tolerance: 0.10,
            rate_limit_max_signals: 3,
            rate_limit_window_secs: 60,
            symbol_order_cooldown_secs: 600,
            global_order_interval_secs: 30,
        }
    }
}

/// Per-symbol backoff, fill-rate monitoring and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub base_cooldown_secs: i64,      // 60
    pub extended_cooldown_secs: i64,  // 300
    pub max_backoff_secs: i64,        // 300
    pub failure_streak_threshold: u32, // 3

    pub fill_rate_window: usize,      // 20 attempts
    pub fill_rate_min_samples: usize, // 5
    pub fill_rate_warning: f64,       // 0.10
    pub fill_rate_critical: f64,      // 0.05
    pub history_capacity: usize,      // 100

    pub max_retries: u32,         // 2 (3 total tries)
    pub retry_base_delay_ms: u64, // 500
    pub retry_max_delay_ms: u64,  // 3000

    /// Decimal places order sizes are rounded to
    pub size_decimals: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_cooldown_secs: 60,
            extended_cooldown_secs: 300,
            max_backoff_secs: 300,
            failure_streak_threshold: 3,
            fill_rate_window: 20,
            fill_rate_min_samples: 5,
            fill_rate_warning: 0.10,
            fill_rate_critical: 0.05,
            history_capacity: 100,
            max_retries: 2,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 3000,
            size_decimals: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub quality: QualityGateConfig,
    pub admission: AdmissionConfig,
    pub selector: SelectorConfig,
    pub execution: ExecutionConfig,

    // Market context defaults (used when a signal arrives without one)
    pub taker_fee_rate: f64,          // 0.0005 (5 bps per side)
    pub min_fee_per_order: f64,       // 0.0
    pub default_expected_move_pct: f64, // 0.004 (0.4%)

    // Portfolio (paper mode)
    pub portfolio_equity: f64,
    pub portfolio_peak_equity: f64,

    // Runtime
    /// Symbols to trade; empty accepts every symbol
    pub watchlist: Vec<String>,
    pub paper_trading: bool,
    pub paper_fill_probability: f64,
    pub paper_transient_failure_rate: f64,
    pub paper_latency_ms: u64,
    pub paper_seed: Option<u64>,
    pub worker_queue_depth: usize,
    pub stats_log_interval_seconds: u64,
    pub metrics_log_interval_signals: u64,
    pub strategy_refresh_seconds: u64,
    pub strategy_candidates_path: Option<String>,

    // Alerts
    pub alert_webhook_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            quality: QualityGateConfig::default(),
            admission: AdmissionConfig::default(),
            selector: SelectorConfig::default(),
            execution: ExecutionConfig::default(),
            taker_fee_rate: 0.0005,
            min_fee_per_order: 0.0,
            default_expected_move_pct: 0.004,
            portfolio_equity: 10_000.0,
            portfolio_peak_equity: 10_000.0,
            watchlist: Vec::new(),
            paper_trading: true,
            paper_fill_probability: 0.8,
            paper_transient_failure_rate: 0.05,
            paper_latency_ms: 50,
            paper_seed: None,
            worker_queue_depth: 64,
            stats_log_interval_seconds: 60,
            metrics_log_interval_signals: 100,
            strategy_refresh_seconds: 900,
            strategy_candidates_path: None,
            alert_webhook_url: String::new(),
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Comma-separated symbols, upper-cased, blanks dropped.
fn parse_watchlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let quality = QualityGateConfig {
            extreme_rsi_min_confidence: env_or(
                "MIN_CONFIDENCE_EXTREME_RSI",
                d.quality.extreme_rsi_min_confidence,
            )?,
            moderate_rsi_min_confidence: env_or(
                "MIN_CONFIDENCE_MODERATE_RSI",
                d.quality.moderate_rsi_min_confidence,
            )?,
            band_touch_min_confidence: env_or(
                "MIN_CONFIDENCE_BAND_TOUCH",
                d.quality.band_touch_min_confidence,
            )?,
            default_min_confidence: env_or("MIN_CONFIDENCE", d.quality.default_min_confidence)?,
            edge_fee_multiple: env_or("EDGE_FEE_MULTIPLE", d.quality.edge_fee_multiple)?,
            fresh_entry_cooldown_secs: env_or(
                "SIGNAL_COOLDOWN_SECS",
                d.quality.fresh_entry_cooldown_secs,
            )?,
            reentry_cooldown_secs: env_or("REENTRY_COOLDOWN_SECS", d.quality.reentry_cooldown_secs)?,
            reentry_min_price_move: env_or(
                "REENTRY_MIN_PRICE_MOVE",
                d.quality.reentry_min_price_move,
            )?,
            ..d.quality
        };

        let admission = AdmissionConfig {
            dedup_window_secs: env_or("DEDUP_WINDOW_SECS", d.admission.dedup_window_secs)?,
            dedup_price_tolerance: env_or(
                "DEDUP_PRICE_TOLERANCE",
                d.admission.dedup_price_tolerance,
            )?,
            dedup_confidence_tolerance: env_or(
                "DEDUP_CONFIDENCE_TOLERANCE",
                d.admission.dedup_confidence_tolerance,
            )?,
            rate_limit_max_signals: env_or(
                "RATE_LIMIT_MAX_SIGNALS",
                d.admission.rate_limit_max_signals,
            )?,
            rate_limit_window_secs: env_or(
                "RATE_LIMIT_WINDOW_SECS",
                d.admission.rate_limit_window_secs,
            )?,
            symbol_order_cooldown_secs: env_or(
                "ORDER_COOLDOWN_SECS",
                d.admission.symbol_order_cooldown_secs,
            )?,
            global_order_interval_secs: env_or(
                "GLOBAL_ORDER_INTERVAL_SECS",
                d.admission.global_order_interval_secs,
            )?,
        };

        let selector = SelectorConfig {
            min_sharpe: env_or("SELECTOR_MIN_SHARPE", d.selector.min_sharpe)?,
            min_win_rate: env_or("SELECTOR_MIN_WIN_RATE", d.selector.min_win_rate)?,
            max_drawdown: env_or("SELECTOR_MAX_DRAWDOWN", d.selector.max_drawdown)?,
            min_trade_count: env_or("SELECTOR_MIN_TRADES", d.selector.min_trade_count)?,
            min_total_return: env_or("SELECTOR_MIN_RETURN", d.selector.min_total_return)?,
            return_weight: env_or("SELECTOR_RETURN_WEIGHT", d.selector.return_weight)?,
            sharpe_weight: env_or("SELECTOR_SHARPE_WEIGHT", d.selector.sharpe_weight)?,
            win_rate_weight: env_or("SELECTOR_WIN_RATE_WEIGHT", d.selector.win_rate_weight)?,
            drawdown_weight: env_or("SELECTOR_DRAWDOWN_WEIGHT", d.selector.drawdown_weight)?,
            fallback_strategy: env_or(
                "FALLBACK_STRATEGY",
                d.selector.fallback_strategy.clone(),
            )?,
            max_position_fraction: env_or(
                "MAX_POSITION_FRACTION",
                d.selector.max_position_fraction,
            )?,
            ..d.selector.clone()
        };

        let execution = ExecutionConfig {
            base_cooldown_secs: env_or("BASE_ORDER_COOLDOWN_SECS", d.execution.base_cooldown_secs)?,
            extended_cooldown_secs: env_or(
                "EXTENDED_COOLDOWN_SECS",
                d.execution.extended_cooldown_secs,
            )?,
            max_backoff_secs: env_or("MAX_BACKOFF_SECS", d.execution.max_backoff_secs)?,
            fill_rate_window: env_or("FILL_RATE_WINDOW", d.execution.fill_rate_window)?,
            fill_rate_warning: env_or("FILL_RATE_WARNING", d.execution.fill_rate_warning)?,
            fill_rate_critical: env_or("FILL_RATE_CRITICAL", d.execution.fill_rate_critical)?,
            max_retries: env_or("ORDER_MAX_RETRIES", d.execution.max_retries)?,
            retry_max_delay_ms: env_or("ORDER_RETRY_CAP_MS", d.execution.retry_max_delay_ms)?,
            ..d.execution
        };

        let config = Self {
            quality,
            admission,
            selector,
            execution,
            taker_fee_rate: env_or("TAKER_FEE_RATE", d.taker_fee_rate)?,
            min_fee_per_order: env_or("MIN_FEE_PER_ORDER", d.min_fee_per_order)?,
            default_expected_move_pct: env_or(
                "DEFAULT_EXPECTED_MOVE_PCT",
                d.default_expected_move_pct,
            )?,
            portfolio_equity: env_or("PORTFOLIO_EQUITY", d.portfolio_equity)?,
            portfolio_peak_equity: env_or("PORTFOLIO_PEAK_EQUITY", d.portfolio_peak_equity)?,
            watchlist: env::var("WATCHLIST")
                .map(|raw| parse_watchlist(&raw))
                .unwrap_or_default(),
            paper_trading: env_or("PAPER_TRADING", d.paper_trading)?,
            paper_fill_probability: env_or("PAPER_FILL_PROBABILITY", d.paper_fill_probability)?,
            paper_transient_failure_rate: env_or(
                "PAPER_TRANSIENT_FAILURE_RATE",
                d.paper_transient_failure_rate,
            )?,
            paper_latency_ms: env_or("PAPER_LATENCY_MS", d.paper_latency_ms)?,
            paper_seed: env::var("PAPER_SEED").ok().and_then(|s| s.parse().ok()),
            worker_queue_depth: env_or("WORKER_QUEUE_DEPTH", d.worker_queue_depth)?,
            stats_log_interval_seconds: env_or(
                "STATS_LOG_INTERVAL",
                d.stats_log_interval_seconds,
            )?,
            metrics_log_interval_signals: env_or(
                "METRICS_LOG_INTERVAL_SIGNALS",
                d.metrics_log_interval_signals,
            )?,
            strategy_refresh_seconds: env_or("STRATEGY_REFRESH_SECS", d.strategy_refresh_seconds)?,
            strategy_candidates_path: env::var("STRATEGY_CANDIDATES_PATH").ok(),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let q = &self.quality;
        for (name, value) in [
            ("extreme_rsi_min_confidence", q.extreme_rsi_min_confidence),
            ("moderate_rsi_min_confidence", q.moderate_rsi_min_confidence),
            ("band_touch_min_confidence", q.band_touch_min_confidence),
            ("default_min_confidence", q.default_min_confidence),
            ("paper_fill_probability", self.paper_fill_probability),
            ("paper_transient_failure_rate", self.paper_transient_failure_rate),
            ("fill_rate_warning", self.execution.fill_rate_warning),
            ("fill_rate_critical", self.execution.fill_rate_critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if q.edge_fee_multiple < 0.0 {
            bail!("edge_fee_multiple must be non-negative");
        }
        if q.reentry_cooldown_secs < q.fresh_entry_cooldown_secs {
            bail!("reentry_cooldown_secs must be >= fresh_entry_cooldown_secs");
        }

        let a = &self.admission;
        if a.rate_limit_max_signals == 0 || a.rate_limit_window_secs <= 0 {
            bail!("rate limit needs a positive count and window");
        }
        if a.dedup_window_secs < 0 || a.symbol_order_cooldown_secs < 0 || a.global_order_interval_secs < 0
        {
            bail!("admission windows must be non-negative");
        }

        let e = &self.execution;
        if e.base_cooldown_secs <= 0 {
            bail!("base_cooldown_secs must be positive");
        }
        if e.max_backoff_secs < e.base_cooldown_secs {
            bail!("max_backoff_secs must be >= base_cooldown_secs");
        }
        if e.failure_streak_threshold < 2 {
            bail!("failure_streak_threshold must be at least 2");
        }
        if e.fill_rate_critical > e.fill_rate_warning {
            bail!("fill_rate_critical must not exceed fill_rate_warning");
        }
        if e.fill_rate_window == 0 || e.history_capacity < e.fill_rate_window {
            bail!("history_capacity must cover a non-empty fill_rate_window");
        }
        if e.retry_max_delay_ms < e.retry_base_delay_ms {
            bail!("retry_max_delay_ms must be >= retry_base_delay_ms");
        }

        self.selector
            .validate()
            .context("strategy selector config")?;

        if self.portfolio_equity <= 0.0 {
            bail!("portfolio_equity must be positive");
        }
        if self.taker_fee_rate < 0.0 || self.min_fee_per_order < 0.0 {
            bail!("fees must be non-negative");
        }
        if self.worker_queue_depth == 0 {
            bail!("worker_queue_depth must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_catches_inverted_thresholds() {
        let mut config = AgentConfig::default();
        config.execution.fill_rate_critical = 0.2;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.execution.max_backoff_secs = 30;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.quality.default_min_confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.selector.sharpe_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_watchlist() {
        assert_eq!(parse_watchlist(" btc, ETH,,sol "), vec!["BTC", "ETH", "SOL"]);
        assert!(parse_watchlist("").is_empty());
    }

    #[test]
    fn test_env_or_parses_and_defaults() {
        std::env::set_var("AGENT_TEST_ENV_OR_VALUE", " 42 ");
        assert_eq!(env_or("AGENT_TEST_ENV_OR_VALUE", 7u32).unwrap(), 42);
        assert_eq!(env_or("AGENT_TEST_ENV_OR_MISSING", 7u32).unwrap(), 7);

        std::env::set_var("AGENT_TEST_ENV_OR_BAD", "not-a-number");
        assert!(env_or("AGENT_TEST_ENV_OR_BAD", 1.0f64).is_err());
    }
}
