use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::risk_manager::{BlockReason, RiskDecision, RiskManager};
use crate::ai::{EnsembleOrchestrator, ModelSlot};
use crate::core::config::EngineConfig;
use crate::core::error::{DataError, EngineError, ExecutionError};
use crate::core::HealthChecker;
use crate::execution::exchange::{ExchangeAdapter, FillStream, PaperExchange};
use crate::execution::{ExitReason, Order, OrderManager};
use crate::monitoring::{EngineMetrics, EventBus, EventKind};
use crate::portfolio::{PortfolioLedger, PortfolioState, SnapshotStore};
use crate::strategy::{FeatureBuilder, FusedSignal, MarketSnapshot};

const WORKER_QUEUE: usize = 256;

/// What happened to one snapshot.
#[derive(Debug)]
pub enum TickOutcome {
    Halted,
    Skipped(DataError),
    /// Risk evaluation overran its deadline; the signal counted as flat.
    DeadlineOverrun,
    Blocked(BlockReason),
    Executed(Order),
    ExecutionFailed(ExecutionError),
}

/// Channels into the per-symbol workers plus the background tasks.
pub struct EngineHandle {
    feeds: HashMap<String, mpsc::Sender<MarketSnapshot>>,
    workers: Vec<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Queues a snapshot on its symbol's worker. Unknown symbols are dropped.
    pub async fn dispatch(&self, snapshot: MarketSnapshot) -> bool {
        match self.feeds.get(&snapshot.symbol) {
            Some(feed) => feed.send(snapshot).await.is_ok(),
            None => {
                tracing::warn!("⚠️  No worker for {}; snapshot dropped", snapshot.symbol);
                false
            }
        }
    }
}

/// Runs the tick pipeline for every configured symbol.
pub struct TradingEngine {
    config: EngineConfig,
    features: FeatureBuilder,
    ensemble: EnsembleOrchestrator,
    risk: Mutex<RiskManager>,
    orders: Arc<OrderManager>,
    ledger: Arc<PortfolioLedger>,
    paper: Option<Arc<PaperExchange>>,
    events: Arc<EventBus>,
    metrics: EngineMetrics,
    health: Arc<HealthChecker>,
    terminal_rx: Mutex<Option<mpsc::UnboundedReceiver<Order>>>,
}

impl TradingEngine {
    pub async fn new(
        config: EngineConfig,
        models: Vec<ModelSlot>,
        exchange: Arc<dyn ExchangeAdapter>,
        store: Arc<dyn SnapshotStore>,
        events: Arc<EventBus>,
        metrics: EngineMetrics,
    ) -> Result<Self, EngineError> {
        let health = Arc::new(HealthChecker::new());

        let ledger = Arc::new(
            PortfolioLedger::restore(config.ledger.initial_equity, store, events.clone()).await?,
        );
        health.update_component("snapshot_store", true).await;

        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let orders = Arc::new(
            OrderManager::new(exchange, ledger.clone(), events.clone(), config.execution.clone())
                .with_metrics(metrics.clone())
                .with_terminal_notifier(terminal_tx),
        );
        health.update_component("exchange", true).await;

        let ensemble = EnsembleOrchestrator::new(
            models,
            config.ensemble.quorum,
            config.ensemble.fusion_policy,
            events.clone(),
        )
        .with_metrics(metrics.clone());
        health.update_component("models", ensemble.model_count() > 0).await;

        tracing::info!(
            "🚀 Engine ready: {} symbols, {} models (quorum {})",
            config.symbols.len(),
            ensemble.model_count(),
            config.ensemble.quorum
        );

        Ok(Self {
            features: FeatureBuilder::new(config.data.staleness_threshold_ms),
            risk: Mutex::new(RiskManager::new(config.risk.clone())),
            config,
            ensemble,
            orders,
            ledger,
            paper: None,
            events,
            metrics,
            health,
            terminal_rx: Mutex::new(Some(terminal_rx)),
        })
    }

    /// Keeps the paper venue's price book in step with the feed.
    pub fn with_paper_exchange(mut self, paper: Arc<PaperExchange>) -> Self {
        self.paper = Some(paper);
        self
    }

    pub fn health(&self) -> Arc<HealthChecker> {
        self.health.clone()
    }

    pub fn orders(&self) -> Arc<OrderManager> {
        self.orders.clone()
    }

    pub fn ledger(&self) -> Arc<PortfolioLedger> {
        self.ledger.clone()
    }

    pub async fn portfolio(&self) -> PortfolioState {
        self.ledger.snapshot().await
    }

    /// Spawns one worker per symbol plus the fill and order-completion pumps.
    pub async fn start(self: &Arc<Self>, fills: FillStream) -> EngineHandle {
        let mut feeds = HashMap::new();
        let mut workers = Vec::new();
        for symbol in &self.config.symbols {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            feeds.insert(symbol.clone(), tx);
            workers.push(tokio::spawn(self.clone().run_worker(symbol.clone(), rx)));
        }

        let mut pumps = vec![tokio::spawn(self.clone().pump_fills(fills))];
        if let Some(rx) = self.terminal_rx.lock().await.take() {
            pumps.push(tokio::spawn(self.clone().pump_completions(rx)));
        }

        tracing::info!("✅ {} symbol workers started", workers.len());
        EngineHandle {
            feeds,
            workers,
            pumps,
        }
    }

    async fn run_worker(self: Arc<Self>, symbol: String, mut rx: mpsc::Receiver<MarketSnapshot>) {
        let mut previous: Option<MarketSnapshot> = None;
        while let Some(snapshot) = rx.recv().await {
            let outcome = self.process_tick(&snapshot, previous.as_ref()).await;
            tracing::trace!("{} tick: {:?}", symbol, outcome);
            previous = Some(snapshot);
        }
        tracing::debug!("{} worker stopped", symbol);
    }

    async fn pump_fills(self: Arc<Self>, mut fills: FillStream) {
        while let Some(report) = fills.recv().await {
            if let Err(e) = self.orders.on_fill(report).await {
                if e.is_fatal() {
                    for symbol in self.orders.halted_symbols().await {
                        self.health.mark_halted(&symbol).await;
                    }
                } else {
                    tracing::warn!("⚠️  Fill rejected: {}", e);
                }
            }
        }
    }

    async fn pump_completions(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Order>) {
        while let Some(order) = rx.recv().await {
            if order.intent.is_entry() {
                self.risk.lock().await.release(&order.symbol);
            }
        }
    }

    /// One pass of the pipeline for one snapshot: features, ensemble, risk, execution.
    pub async fn process_tick(
        &self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
    ) -> TickOutcome {
        let symbol = snapshot.symbol.as_str();
        if self.orders.is_halted(symbol).await {
            return TickOutcome::Halted;
        }

        let now = Utc::now();
        let features = match self.features.build(snapshot, previous, now) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!("⏭️  Tick skipped: {}", e);
                self.metrics.record_skip(skip_reason(&e));
                self.events.emit(
                    EventKind::TickSkipped,
                    json!({ "symbol": symbol, "reason": e.to_string() }),
                );
                return TickOutcome::Skipped(e);
            }
        };

        let price = features.close();
        if let Some(paper) = &self.paper {
            paper.update_price(symbol, price).await;
        }
        if let Err(e) = self.orders.on_price(symbol, price).await {
            tracing::warn!("⚠️  Protective exit for {} failed: {}", symbol, e);
        }

        self.maintain_breaker().await;

        let signal = self.ensemble.evaluate(&features).await;

        // Read, evaluate and reserve under one lock. Completions release a
        // reservation under it only after the fill is in the ledger.
        let decision = {
            let mut risk = self.risk.lock().await;
            let portfolio = self.ledger.snapshot().await;
            let was_tripped = risk.breaker_tripped();
            let decision = risk.evaluate_within_deadline(&signal, &features, &portfolio, now);
            if !was_tripped && risk.breaker_tripped() {
                self.events.emit(
                    EventKind::DrawdownBreach,
                    json!({
                        "drawdown": portfolio.drawdown,
                        "limit": risk.config().max_drawdown,
                        "equity": portfolio.equity,
                        "peak_equity": portfolio.peak_equity,
                    }),
                );
            }
            decision
        };

        match decision {
            None => TickOutcome::DeadlineOverrun,
            Some(RiskDecision::Blocked(reason)) => {
                self.report_block(&signal, reason);
                TickOutcome::Blocked(reason)
            }
            Some(RiskDecision::Approved(approved)) => match self.orders.execute(&approved).await {
                Ok(order) => TickOutcome::Executed(order),
                Err(e) => {
                    self.risk.lock().await.release(symbol);
                    if let ExecutionError::SymbolHalted(_) = e {
                        self.health.mark_halted(symbol).await;
                    }
                    TickOutcome::ExecutionFailed(e)
                }
            },
        }
    }

    fn report_block(&self, signal: &FusedSignal, reason: BlockReason) {
        if reason == BlockReason::NoSignal {
            return;
        }
        self.metrics.record_block(reason.as_str());
        self.events.emit(
            EventKind::RiskBlocked,
            json!({
                "symbol": signal.symbol,
                "action": signal.action,
                "confidence": signal.confidence,
                "reason": reason,
            }),
        );
    }

    async fn maintain_breaker(&self) {
        let elapsed = {
            let risk = self.risk.lock().await;
            risk.breaker_tripped() && risk.cooldown_elapsed(Utc::now())
        };
        if elapsed {
            self.reset_breaker().await;
        }
    }

    /// Re-arms the drawdown breaker and rebases peak equity to current equity.
    pub async fn reset_breaker(&self) {
        let mut risk = self.risk.lock().await;
        if !risk.breaker_tripped() {
            return;
        }
        risk.reset_breaker();
        self.ledger.reset_peak().await;
        drop(risk);
        self.events.emit(EventKind::BreakerReset, json!({ "at": Utc::now() }));
    }

    /// Rebalances model vote weights from performance metrics, e.g. recent accuracy.
    pub async fn update_model_weights(&self, performance: &HashMap<String, f64>) -> Result<(), EngineError> {
        self.ensemble.update_weights(performance).await?;
        Ok(())
    }

    pub async fn breaker_tripped(&self) -> bool {
        self.risk.lock().await.breaker_tripped()
    }

    /// Stops the workers, closes every open position and persists the final state.
    pub async fn shutdown(&self, handle: EngineHandle) -> Result<(), EngineError> {
        tracing::info!("🛑 Shutting down engine...");
        let EngineHandle {
            feeds,
            workers,
            pumps,
        } = handle;
        drop(feeds);
        for worker in workers {
            let _ = worker.await;
        }

        let open: Vec<String> = self.ledger.snapshot().await.positions.into_keys().collect();
        for symbol in &open {
            if let Err(e) = self.orders.close_position(symbol, ExitReason::Shutdown).await {
                tracing::error!("❌ Failed to close {} on shutdown: {}", symbol, e);
            }
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.execution.lane_wait_timeout_ms);
        while !self.ledger.snapshot().await.positions.is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining = self.ledger.snapshot().await.open_trades;
        if remaining > 0 {
            tracing::warn!("⚠️  {} positions still open at shutdown", remaining);
        }

        for pump in pumps {
            pump.abort();
        }
        self.ledger.checkpoint().await?;
        tracing::info!("✅ Engine stopped");
        Ok(())
    }
}

fn skip_reason(error: &DataError) -> &'static str {
    match error {
        DataError::StaleData { .. } => "stale",
        DataError::MissingField { .. } => "missing_field",
        DataError::InvalidPrice { .. } => "invalid_price",
    }
}
