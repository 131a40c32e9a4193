use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use ensemble_trading_bot::ai::{ModelSlot, PredictiveModel};
use ensemble_trading_bot::core::config::ExecutionConfig;
use ensemble_trading_bot::core::{DataError, EngineConfig, PersistenceError};
use ensemble_trading_bot::execution::{
    fill_channel, Order, OrderIntent, OrderManager, OrderStatus, PaperExchange, Side,
};
use ensemble_trading_bot::monitoring::{EngineMetrics, EventBus, EventKind};
use ensemble_trading_bot::portfolio::{
    FillKey, LedgerSnapshot, MemorySnapshotStore, PortfolioLedger, RestoredLedger, SnapshotStore,
};
use ensemble_trading_bot::strategy::{Action, FeatureVector, MarketSnapshot, ModelSignal};
use ensemble_trading_bot::trading::{BlockReason, TickOutcome, TradingEngine};

struct ConstantModel {
    id: String,
    action: Action,
    confidence: f64,
    fail: bool,
}

#[async_trait]
impl PredictiveModel for ConstantModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, _features: &FeatureVector) -> anyhow::Result<ModelSignal> {
        if self.fail {
            anyhow::bail!("model offline");
        }
        Ok(ModelSignal::new(&self.id, self.action, self.confidence))
    }
}

fn models(action: Action, confidence: f64, fail: bool) -> Vec<ModelSlot> {
    (0..3)
        .map(|i| {
            ModelSlot::new(
                Arc::new(ConstantModel {
                    id: format!("m{}", i),
                    action,
                    confidence,
                    fail,
                }),
                1.0,
                Duration::from_millis(100),
            )
        })
        .collect()
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    config.execution.lane_wait_timeout_ms = 1_000;
    config.execution.retry.initial_backoff_ms = 1;
    config
}

/// 30 closes alternating around `close`, roughly 2% return volatility.
fn snapshot(symbol: &str, close: f64) -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::new(symbol, Utc::now(), close);
    snapshot.closes = (0..30)
        .map(|i| if i % 2 == 0 { close * 0.99 } else { close * 1.01 })
        .collect();
    snapshot.volume = Some(1_000.0);
    snapshot.volumes = vec![1_000.0; 30];
    snapshot
}

async fn engine(
    models: Vec<ModelSlot>,
    store: Arc<dyn SnapshotStore>,
) -> (Arc<TradingEngine>, ensemble_trading_bot::execution::exchange::FillStream) {
    engine_with(models, store, config(), Arc::new(EventBus::new(1024))).await
}

async fn engine_with(
    models: Vec<ModelSlot>,
    store: Arc<dyn SnapshotStore>,
    config: EngineConfig,
    events: Arc<EventBus>,
) -> (Arc<TradingEngine>, ensemble_trading_bot::execution::exchange::FillStream) {
    let (fill_tx, fill_rx) = fill_channel();
    let paper = Arc::new(PaperExchange::new(fill_tx, config.execution.paper_fill_slices));
    let engine = TradingEngine::new(
        config,
        models,
        paper.clone(),
        store,
        events,
        EngineMetrics::new().unwrap(),
    )
    .await
    .unwrap()
    .with_paper_exchange(paper);
    (Arc::new(engine), fill_rx)
}

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn partial_fills_through_paper_exchange_complete_the_order() {
    let (fill_tx, mut fill_rx) = fill_channel();
    let paper = Arc::new(PaperExchange::new(fill_tx, 2));
    paper.update_price("BTCUSDT", 100.0).await;

    let events = Arc::new(EventBus::new(256));
    let ledger = Arc::new(PortfolioLedger::new(
        10_000.0,
        Arc::new(MemorySnapshotStore::new()),
        events.clone(),
    ));
    let orders = OrderManager::new(paper, ledger.clone(), events, ExecutionConfig::default());

    let order = orders
        .submit(Order::new(
            "BTCUSDT",
            Side::Buy,
            2.0,
            OrderIntent::Entry {
                stop_loss: 98.0,
                take_profit: 104.0,
            },
        ))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), fill_rx.recv()).await.unwrap().unwrap();
    orders.on_fill(first.clone()).await.unwrap();
    assert_eq!(
        orders.order(&order.id).await.unwrap().status,
        OrderStatus::PartiallyFilled
    );

    // A redelivered fill changes nothing.
    orders.on_fill(first).await.unwrap();

    let second = timeout(Duration::from_secs(1), fill_rx.recv()).await.unwrap().unwrap();
    orders.on_fill(second).await.unwrap();

    assert_eq!(orders.order(&order.id).await.unwrap().status, OrderStatus::Filled);
    assert!((ledger.filled_quantity(&order.id).await - 2.0).abs() < 1e-9);
    assert!((ledger.position("BTCUSDT").await.unwrap().size - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn engine_opens_and_closes_position_end_to_end() {
    let (engine, fills) = engine(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
    )
    .await;
    let handle = engine.start(fills).await;

    assert!(handle.dispatch(snapshot("BTCUSDT", 100.0)).await);
    let opened = wait_for(|| {
        let engine = engine.clone();
        async move { engine.portfolio().await.has_position("BTCUSDT") }
    })
    .await;
    assert!(opened, "position never opened");

    let portfolio = engine.portfolio().await;
    let position = &portfolio.positions["BTCUSDT"];
    // Volatility sizing exceeds the cap, so the 20% notional cap binds.
    assert!((position.size - 20.0).abs() < 1e-6);
    assert!((position.stop_loss - 98.0).abs() < 1e-9);
    assert_eq!(portfolio.daily_trades, 1);

    engine.shutdown(handle).await.unwrap();
    let closed = engine.portfolio().await;
    assert!(closed.positions.is_empty());
    assert!(closed.realized_pnl.abs() < 1e-9);
}

#[tokio::test]
async fn stale_snapshot_is_skipped() {
    let (engine, _fills) = engine(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
    )
    .await;

    let mut stale = snapshot("BTCUSDT", 100.0);
    stale.timestamp = Utc::now() - ChronoDuration::seconds(30);
    let outcome = engine.process_tick(&stale, None).await;
    assert!(matches!(
        outcome,
        TickOutcome::Skipped(DataError::StaleData { .. })
    ));
}

#[tokio::test]
async fn failed_quorum_is_never_traded() {
    let (engine, _fills) = engine(
        models(Action::Long, 0.9, true),
        Arc::new(MemorySnapshotStore::new()),
    )
    .await;

    let outcome = engine.process_tick(&snapshot("BTCUSDT", 100.0), None).await;
    assert!(matches!(outcome, TickOutcome::Blocked(BlockReason::NoSignal)));
    assert!(engine.orders().active_orders().await.is_empty());
}

#[tokio::test]
async fn low_confidence_block_is_reported() {
    let events = Arc::new(EventBus::new(1024));
    let mut rx = events.subscribe();
    let (fill_tx, _fills) = fill_channel();
    let paper = Arc::new(PaperExchange::new(fill_tx, 1));
    let engine = TradingEngine::new(
        config(),
        models(Action::Short, 0.3, false),
        paper,
        Arc::new(MemorySnapshotStore::new()),
        events,
        EngineMetrics::new().unwrap(),
    )
    .await
    .unwrap();

    let outcome = engine.process_tick(&snapshot("ETHUSDT", 50.0), None).await;
    assert!(matches!(outcome, TickOutcome::Blocked(BlockReason::LowConfidence)));

    let mut blocked = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::RiskBlocked {
            assert_eq!(event.payload["reason"], "low_confidence");
            blocked += 1;
        }
    }
    assert_eq!(blocked, 1);
}

struct ReadOnlyStore;

#[async_trait]
impl SnapshotStore for ReadOnlyStore {
    async fn save(
        &self,
        _snapshot: &LedgerSnapshot,
        _new_fills: &[FillKey],
    ) -> Result<(), PersistenceError> {
        Err(PersistenceError::Corrupt("read-only volume".to_string()))
    }

    async fn load(&self) -> Result<Option<RestoredLedger>, PersistenceError> {
        Ok(None)
    }
}

#[tokio::test]
async fn persistence_failure_halts_only_that_symbol() {
    let (engine, fills) = engine(models(Action::Long, 0.9, false), Arc::new(ReadOnlyStore)).await;
    let handle = engine.start(fills).await;

    let outcome = engine.process_tick(&snapshot("BTCUSDT", 100.0), None).await;
    assert!(matches!(outcome, TickOutcome::Executed(_)));

    let health = engine.health();
    let halted = wait_for(|| {
        let health = health.clone();
        async move {
            health
                .get_status()
                .await
                .halted_symbols
                .contains(&"BTCUSDT".to_string())
        }
    })
    .await;
    assert!(halted, "symbol was not halted");
    assert!(engine.orders().is_halted("BTCUSDT").await);

    let again = engine.process_tick(&snapshot("BTCUSDT", 100.0), None).await;
    assert!(matches!(again, TickOutcome::Halted));

    let other = engine.process_tick(&snapshot("ETHUSDT", 50.0), None).await;
    assert!(matches!(other, TickOutcome::Executed(_)));

    assert_eq!(health.get_status().await.status, "degraded");

    drop(handle);
}

#[tokio::test]
async fn deadline_overrun_counts_as_flat() {
    let mut config = config();
    config.risk.evaluation_deadline_ms = 0;
    let (engine, _fills) = engine_with(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
        config,
        Arc::new(EventBus::new(1024)),
    )
    .await;

    let outcome = engine.process_tick(&snapshot("BTCUSDT", 100.0), None).await;
    assert!(matches!(outcome, TickOutcome::DeadlineOverrun));
    assert!(engine.orders().active_orders().await.is_empty());
    assert!(engine.portfolio().await.positions.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_symbols_share_the_open_trade_cap() {
    let mut config = config();
    config.risk.max_open_trades = 1;
    let (engine, fills) = engine_with(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
        config,
        Arc::new(EventBus::new(4096)),
    )
    .await;
    let handle = engine.start(fills).await;

    // Rounds keep racing ticks against fills and completions landing in between.
    let mut executed = 0;
    for _ in 0..20 {
        let btc = snapshot("BTCUSDT", 100.0);
        let eth = snapshot("ETHUSDT", 50.0);
        let (a, b) = tokio::join!(
            engine.process_tick(&btc, None),
            engine.process_tick(&eth, None)
        );
        for outcome in [a, b] {
            match outcome {
                TickOutcome::Executed(_) => executed += 1,
                TickOutcome::Blocked(reason) => assert!(matches!(
                    reason,
                    BlockReason::MaxOpenTrades | BlockReason::PositionExists
                )),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(engine.portfolio().await.open_trades <= 1);
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(executed, 1);

    let settled = wait_for(|| {
        let engine = engine.clone();
        async move { engine.portfolio().await.open_trades == 1 }
    })
    .await;
    assert!(settled, "the single entry never filled");
    drop(handle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drawdown_breaker_blocks_every_symbol_once() {
    let events = Arc::new(EventBus::new(4096));
    let mut rx = events.subscribe();
    let mut config = config();
    config.risk.stop_loss_pct = 0.5;
    config.risk.max_drawdown = 0.01;
    let (engine, fills) = engine_with(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
        config,
        events,
    )
    .await;
    let handle = engine.start(fills).await;

    let opened = engine.process_tick(&snapshot("BTCUSDT", 100.0), None).await;
    assert!(matches!(opened, TickOutcome::Executed(_)));
    let filled = wait_for(|| {
        let engine = engine.clone();
        async move { engine.portfolio().await.has_position("BTCUSDT") }
    })
    .await;
    assert!(filled, "position never opened");

    // 20 units down 10 is a 2% drawdown against a 1% limit.
    engine.ledger().mark_price("BTCUSDT", 90.0).await;
    let btc = snapshot("BTCUSDT", 90.0);
    let eth = snapshot("ETHUSDT", 50.0);
    let (a, b) = tokio::join!(
        engine.process_tick(&btc, None),
        engine.process_tick(&eth, None)
    );
    assert!(matches!(a, TickOutcome::Blocked(BlockReason::DrawdownBreach)));
    assert!(matches!(b, TickOutcome::Blocked(BlockReason::DrawdownBreach)));
    assert!(engine.breaker_tripped().await);

    let mut breaches = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::DrawdownBreach {
            breaches += 1;
        }
    }
    assert_eq!(breaches, 1);
    drop(handle);
}

#[tokio::test]
async fn model_weights_rebalance_through_the_engine() {
    let (engine, _fills) = engine(
        models(Action::Long, 0.9, false),
        Arc::new(MemorySnapshotStore::new()),
    )
    .await;

    let mut performance = std::collections::HashMap::new();
    performance.insert("m0".to_string(), 2.0);
    performance.insert("m1".to_string(), 2.0);
    assert!(engine.update_model_weights(&performance).await.is_ok());

    performance.insert("unknown".to_string(), 1.0);
    assert!(engine.update_model_weights(&performance).await.is_err());
}
