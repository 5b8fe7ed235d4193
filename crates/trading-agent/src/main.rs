use std::sync::Arc;
use std::time::Duration;

use agent_core::SystemClock;
use anyhow::{bail, Context, Result};
use strategy_selector::{PortfolioSnapshot, StrategyCandidate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::SignalKind;
use tokio::time;

use trading_agent::config::AgentConfig;
use trading_agent::notifier::{Alert, AlertNotifier};
use trading_agent::paper_exchange::PaperExchange;
use trading_agent::{EmergencyStop, InboundSignal, Pipeline, SignalRouter};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting order-admission pipeline");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!(
        "  Min confidence: extreme RSI {:.2}, moderate RSI {:.2}, band touch {:.2}, other {:.2}",
        config.quality.extreme_rsi_min_confidence,
        config.quality.moderate_rsi_min_confidence,
        config.quality.band_touch_min_confidence,
        config.quality.default_min_confidence
    );
    tracing::info!(
        "  Order cooldown: {}s per symbol, {}s global",
        config.admission.symbol_order_cooldown_secs,
        config.admission.global_order_interval_secs
    );
    tracing::info!("  Taker fee: {:.3}%", config.taker_fee_rate * 100.0);

    // 3. Exchange: only the paper venue ships with the agent
    if !config.paper_trading {
        bail!("No live exchange transport is built in; set PAPER_TRADING=true");
    }
    let exchange = Arc::new(PaperExchange::new(
        config.paper_fill_probability,
        config.paper_transient_failure_rate,
        Duration::from_millis(config.paper_latency_ms),
        config.paper_seed,
    ));
    tracing::info!(
        "Paper trading mode (fill probability {:.0}%)",
        config.paper_fill_probability * 100.0
    );

    // 4. Pipeline
    let stop = EmergencyStop::new();
    let notifier = Arc::new(AlertNotifier::new(config.alert_webhook_url.clone()));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        exchange,
        Arc::new(SystemClock),
        stop.clone(),
        Some(Arc::clone(&notifier)),
    )?);

    let portfolio = PortfolioSnapshot {
        equity: config.portfolio_equity,
        peak_equity: config.portfolio_peak_equity,
        available_margin: config.portfolio_equity,
    };
    refresh_strategies(&pipeline, &config, &portfolio).await;

    // 5. Main loop: one JSON signal per stdin line
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut router =
        SignalRouter::new(Arc::clone(&pipeline), stop.clone(), config.worker_queue_depth)
            .with_watchlist(config.watchlist.clone());
    if !config.watchlist.is_empty() {
        tracing::info!("Watchlist: {}", config.watchlist.join(", "));
    }

    let mut stats_interval =
        time::interval(Duration::from_secs(config.stats_log_interval_seconds.max(1)));
    let mut refresh_interval =
        time::interval(Duration::from_secs(config.strategy_refresh_seconds.max(1)));
    // Both fire immediately; skip the first tick.
    stats_interval.tick().await;
    refresh_interval.tick().await;

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let mut line_number = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        line_number += 1;
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InboundSignal>(&line) {
                            Ok(inbound) => {
                                if let Err(e) = router.dispatch(inbound) {
                                    tracing::error!("Failed to dispatch signal: {}", e);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(line = line_number, "Skipping malformed signal: {}", e);
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Signal stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read signal stream: {}", e);
                        break;
                    }
                }
            }
            _ = stats_interval.tick() => {
                log_stats(&pipeline);
                if router.dropped() > 0 {
                    tracing::warn!(dropped = router.dropped(), "Signals dropped on full symbol queues");
                }
            }
            _ = refresh_interval.tick() => {
                refresh_strategies(&pipeline, &config, &portfolio).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
                stop.trigger();
                notifier.alert(&Alert::EmergencyStop).await;
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                stop.trigger();
                notifier.alert(&Alert::EmergencyStop).await;
                break;
            }
        }
    }

    // 6. Drain workers, final report
    router.shutdown().await;
    pipeline.log_metrics();
    log_stats(&pipeline);
    tracing::info!("Order-admission pipeline stopped");
    Ok(())
}

async fn load_candidates(path: &str) -> Result<Vec<StrategyCandidate>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading strategy candidates from {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing strategy candidates in {}", path))
}

async fn refresh_strategies(pipeline: &Pipeline, config: &AgentConfig, portfolio: &PortfolioSnapshot) {
    let Some(path) = config.strategy_candidates_path.as_deref() else {
        return;
    };
    match load_candidates(path).await {
        Ok(candidates) => {
            let selection = pipeline.update_strategies(candidates, portfolio.clone());
            tracing::info!(
                strategy = %selection.strategy,
                tested = selection.tested,
                size_multiplier = selection.size_multiplier,
                "Strategy selection refreshed: {}",
                selection.reasoning
            );
        }
        Err(e) => tracing::warn!("Keeping previous strategy selection: {:#}", e),
    }
}

fn log_stats(pipeline: &Pipeline) {
    let stats = pipeline.stats();
    match serde_json::to_string(&stats) {
        Ok(json) => tracing::info!(stats = %json, "Pipeline stats"),
        Err(e) => tracing::warn!("Failed to serialize pipeline stats: {}", e),
    }
}
