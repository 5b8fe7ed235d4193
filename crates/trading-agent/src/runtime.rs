use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::types::{EmergencyStop, InboundSignal};

/// Fans inbound signals out to one worker task per symbol. A symbol's signals
/// are processed in arrival order; symbols never wait on each other, and the
/// caller never waits on any of them.
pub struct SignalRouter {
    pipeline: Arc<Pipeline>,
    stop: EmergencyStop,
    queue_depth: usize,
    workers: HashMap<String, mpsc::Sender<InboundSignal>>,
    handles: Vec<JoinHandle<()>>,
    outcomes: Option<mpsc::UnboundedSender<PipelineOutcome>>,
    watchlist: HashSet<String>,
    dropped: HashMap<String, u64>,
}

impl SignalRouter {
    pub fn new(pipeline: Arc<Pipeline>, stop: EmergencyStop, queue_depth: usize) -> Self {
        Self {
            pipeline,
            stop,
            queue_depth: queue_depth.max(1),
            workers: HashMap::new(),
            handles: Vec::new(),
            outcomes: None,
            watchlist: HashSet::new(),
            dropped: HashMap::new(),
        }
    }

    /// Only route these symbols. An empty list routes everything.
    pub fn with_watchlist(mut self, symbols: impl IntoIterator<Item = String>) -> Self {
        self.watchlist = symbols.into_iter().collect();
        self
    }

    /// Forward every outcome to `tx` as well as logging it.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<PipelineOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals dropped because their symbol's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    pub fn dropped_for(&self, symbol: &str) -> u64 {
        self.dropped.get(symbol).copied().unwrap_or(0)
    }

    /// Queue a signal for its symbol's worker, spawning the worker on first use.
    /// Never waits: a signal for a symbol whose queue is full is dropped and
    /// counted.
    pub fn dispatch(&mut self, inbound: InboundSignal) -> Result<()> {
        if self.stop.is_triggered() {
            tracing::debug!(symbol = %inbound.signal.symbol, "Emergency stop active, dropping signal");
            return Ok(());
        }

        let symbol = inbound.signal.symbol.clone();
        if !self.watchlist.is_empty() && !self.watchlist.contains(&symbol) {
            tracing::debug!(symbol = %symbol, "Not on watchlist, ignoring signal");
            return Ok(());
        }
        if !self.workers.contains_key(&symbol) {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            let handle = tokio::spawn(run_worker(
                symbol.clone(),
                Arc::clone(&self.pipeline),
                self.stop.clone(),
                rx,
                self.outcomes.clone(),
            ));
            self.handles.push(handle);
            self.workers.insert(symbol.clone(), tx);
            tracing::debug!(symbol = %symbol, "Spawned symbol worker");
        }

        let tx = self
            .workers
            .get(&symbol)
            .ok_or_else(|| anyhow!("no worker for {}", symbol))?;
        match tx.try_send(inbound) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.entry(symbol.clone()).or_default();
                *dropped += 1;
                tracing::warn!(
                    symbol = %symbol,
                    dropped = *dropped,
                    queue_depth = self.queue_depth,
                    "Symbol queue full, dropping signal"
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("worker for {} has exited", symbol)),
        }
    }

    /// Close every queue and wait for the workers to drain.
    pub async fn shutdown(mut self) {
        self.workers.clear();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Symbol worker panicked: {}", e);
            }
        }
        tracing::info!(dropped = self.dropped(), "All symbol workers stopped");
    }
}

async fn run_worker(
    symbol: String,
    pipeline: Arc<Pipeline>,
    stop: EmergencyStop,
    mut rx: mpsc::Receiver<InboundSignal>,
    outcomes: Option<mpsc::UnboundedSender<PipelineOutcome>>,
) {
    while let Some(inbound) = rx.recv().await {
        if stop.is_triggered() {
            tracing::info!(symbol = %symbol, "Worker stopping on emergency stop");
            break;
        }

        let outcome = pipeline.process(&inbound.signal, inbound.context).await;
        tracing::debug!(
            symbol = %symbol,
            verdict = %outcome.verdict,
            filled = outcome.filled(),
            "Signal processed: {}",
            outcome.detail
        );
        if let Some(tx) = &outcomes {
            // Receiver gone just means nobody is listening.
            let _ = tx.send(outcome);
        }
    }
}
