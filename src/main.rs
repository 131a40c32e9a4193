use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use ensemble_trading_bot::ai::load_models;
use ensemble_trading_bot::core::logging::init_logging;
use ensemble_trading_bot::core::{EngineConfig, HealthChecker};
use ensemble_trading_bot::execution::{fill_channel, PaperExchange};
use ensemble_trading_bot::monitoring::{EngineMetrics, EventBus};
use ensemble_trading_bot::portfolio::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use ensemble_trading_bot::streaming::ReplayFeed;
use ensemble_trading_bot::trading::TradingEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = EngineConfig::load(config_path.as_deref()).context("loading configuration")?;

    init_logging(&config.monitoring.log_level);

    tracing::info!("🚀 Ensemble Trading Bot starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Symbols: {}", config.symbols.join(", "));

    let models = load_models(&config.ensemble.models).context("loading model artifacts")?;

    let store: Arc<dyn SnapshotStore> = match &config.ledger.database_path {
        Some(path) => Arc::new(
            SqliteSnapshotStore::new(path)
                .await
                .with_context(|| format!("opening snapshot store {}", path))?,
        ),
        None => {
            tracing::warn!("⚠️  No ledger.database_path set - snapshots kept in memory only");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    let events = Arc::new(EventBus::new(config.monitoring.event_capacity));
    let metrics = EngineMetrics::new().context("registering metrics")?;
    spawn_alert_logger(events.clone());

    let (fill_tx, fill_rx) = fill_channel();
    let paper = Arc::new(PaperExchange::new(fill_tx, config.execution.paper_fill_slices));

    let engine = Arc::new(
        TradingEngine::new(
            config.clone(),
            models,
            paper.clone(),
            store,
            events,
            metrics.clone(),
        )
        .await
        .context("starting engine")?
        .with_paper_exchange(paper),
    );

    let health = engine.health();
    let port = config.monitoring.health_port;
    tokio::spawn(async move { start_health_server(health, metrics, port).await });
    tracing::info!("✅ Health endpoint running on port {}", port);

    let handle = engine.start(fill_rx).await;

    match &config.data.replay_path {
        Some(path) => {
            let feed = ReplayFeed::new(path, Duration::from_millis(config.data.replay_interval_ms));
            let sent = feed.run(&handle).await?;
            tracing::info!("📂 Replay finished: {} snapshots dispatched", sent);
        }
        None => {
            tracing::info!("No replay file configured; waiting for Ctrl-C");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
    }

    engine.shutdown(handle).await?;

    let portfolio = engine.portfolio().await;
    tracing::info!(
        "💰 Final equity ${:.2} (realized ${:.2}, {} trades today)",
        portfolio.equity,
        portfolio.realized_pnl,
        portfolio.daily_trades
    );
    Ok(())
}

fn spawn_alert_logger(events: Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!("event {:?}: {}", event.kind, event.payload),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️  Event logger lagged, {} events skipped", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn start_health_server(health_checker: Arc<HealthChecker>, metrics: EngineMetrics, port: u16) {
    use warp::Filter;

    let health = warp::path("health")
        .and(warp::any().map(move || health_checker.clone()))
        .and_then(|checker: Arc<HealthChecker>| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    let metrics = warp::path("metrics")
        .and(warp::any().map(move || metrics.clone()))
        .map(|metrics: EngineMetrics| {
            warp::reply::with_header(metrics.render(), "content-type", "text/plain; version=0.0.4")
        });

    warp::serve(health.or(metrics)).run(([0, 0, 0, 0], port)).await;
}
