use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

use super::exchange::{CancelAck, ExchangeAdapter, ExchangeFill};
use super::order::{ExitReason, Order, OrderId, OrderIntent, OrderStatus};
use crate::core::config::ExecutionConfig;
use crate::core::BoundedMap;
use crate::core::error::{EngineError, ExecutionError, PersistenceError};
use crate::monitoring::{EngineMetrics, EventBus, EventKind};
use crate::portfolio::{Fill, FillOutcome, PortfolioLedger};
use crate::trading::risk_manager::ApprovedOrder;

/// Drives orders through their lifecycle and feeds fills into the ledger.
///
/// Each symbol has a lane: an order holds its symbol's lane from creation until it
/// reaches a terminal state, so later requests for that symbol queue behind it while
/// other symbols proceed. Terminal orders and seen fill keys are kept up to
/// `history_capacity`, oldest forgotten first.
pub struct OrderManager {
    exchange: Arc<dyn ExchangeAdapter>,
    ledger: Arc<PortfolioLedger>,
    events: Arc<EventBus>,
    metrics: Option<EngineMetrics>,
    config: ExecutionConfig,
    active: RwLock<HashMap<OrderId, Order>>,
    archive: RwLock<BoundedMap<OrderId, Order>>,
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    lane_guards: Mutex<HashMap<OrderId, OwnedMutexGuard<()>>>,
    cancel_requests: Mutex<HashSet<OrderId>>,
    seen_fills: Mutex<BoundedMap<(OrderId, u64), ()>>,
    halted: RwLock<HashSet<String>>,
    terminal_tx: Option<mpsc::UnboundedSender<Order>>,
}

impl OrderManager {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        ledger: Arc<PortfolioLedger>,
        events: Arc<EventBus>,
        config: ExecutionConfig,
    ) -> Self {
        let history_capacity = config.history_capacity;
        Self {
            exchange,
            ledger,
            events,
            metrics: None,
            config,
            active: RwLock::new(HashMap::new()),
            archive: RwLock::new(BoundedMap::new(history_capacity)),
            lanes: Mutex::new(HashMap::new()),
            lane_guards: Mutex::new(HashMap::new()),
            cancel_requests: Mutex::new(HashSet::new()),
            seen_fills: Mutex::new(BoundedMap::new(history_capacity)),
            halted: RwLock::new(HashSet::new()),
            terminal_tx: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Every order that reaches a terminal state is sent here.
    pub fn with_terminal_notifier(mut self, tx: mpsc::UnboundedSender<Order>) -> Self {
        self.terminal_tx = Some(tx);
        self
    }

    pub async fn order(&self, order_id: &OrderId) -> Option<Order> {
        if let Some(order) = self.active.read().await.get(order_id) {
            return Some(order.clone());
        }
        self.archive.read().await.get(order_id).cloned()
    }

    pub async fn active_orders(&self) -> Vec<Order> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn is_halted(&self, symbol: &str) -> bool {
        self.halted.read().await.contains(symbol)
    }

    pub async fn halted_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.halted.read().await.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub async fn halt(&self, symbol: &str, reason: &str) {
        if self.halted.write().await.insert(symbol.to_string()) {
            tracing::error!("🛑 Trading halted for {}: {}", symbol, reason);
            self.events.emit(
                EventKind::SymbolHalted,
                json!({ "symbol": symbol, "reason": reason }),
            );
        }
    }

    /// Submits the entry order for an approved decision.
    pub async fn execute(&self, approved: &ApprovedOrder) -> Result<Order, ExecutionError> {
        let order = Order::new(
            &approved.symbol,
            approved.side.entry_side(),
            approved.size,
            OrderIntent::Entry {
                stop_loss: approved.stop_loss,
                take_profit: approved.take_profit,
            },
        );
        self.submit(order).await
    }

    /// Closes the full open position in `symbol`, if any, through the normal submit path.
    ///
    /// A working entry for the symbol would hold the lane, so its remainder is
    /// cancelled first. The exit is sized from the ledger once the lane is free.
    pub async fn close_position(
        &self,
        symbol: &str,
        reason: ExitReason,
    ) -> Result<Option<Order>, ExecutionError> {
        if self.ledger.position(symbol).await.is_none() || self.has_active_exit(symbol).await {
            return Ok(None);
        }
        self.ensure_tradable(symbol).await?;
        self.cancel_resting_entries(symbol).await;

        let guard = self.acquire_lane(symbol).await?;
        let Some(position) = self.ledger.position(symbol).await else {
            return Ok(None);
        };

        tracing::info!(
            "🔔 Closing {} ({}) at {:.4} | PnL: {:.2}",
            symbol,
            reason,
            position.current_price,
            position.unrealized_pnl
        );
        let order = Order::new(
            symbol,
            position.side.exit_side(),
            position.size,
            OrderIntent::Exit { reason },
        );
        self.run(order, guard).await.map(Some)
    }

    /// Marks the ledger to `price` and closes the position if a protective level is crossed.
    pub async fn on_price(&self, symbol: &str, price: f64) -> Result<Option<Order>, ExecutionError> {
        self.ledger.mark_price(symbol, price).await;
        let reason = match self.ledger.position(symbol).await {
            Some(position) => position.close_reason(),
            None => None,
        };
        match reason {
            Some(reason) => self.close_position(symbol, reason).await,
            None => Ok(None),
        }
    }

    async fn has_active_exit(&self, symbol: &str) -> bool {
        self.active
            .read()
            .await
            .values()
            .any(|o| o.symbol == symbol && !o.intent.is_entry())
    }

    async fn cancel_resting_entries(&self, symbol: &str) {
        let entries: Vec<OrderId> = self
            .active
            .read()
            .await
            .values()
            .filter(|o| o.symbol == symbol && o.intent.is_entry())
            .map(|o| o.id.clone())
            .collect();
        for order_id in entries {
            match self.cancel(&order_id).await {
                Ok(order) => tracing::info!(
                    "🚫 Entry {} for {} cancelled ahead of exit ({})",
                    order_id.short(),
                    symbol,
                    order.status.as_str()
                ),
                Err(e) => tracing::warn!(
                    "⚠️  Entry {} for {} still working: {}",
                    order_id.short(),
                    symbol,
                    e
                ),
            }
        }
    }

    async fn lane(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.lanes
            .lock()
            .await
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn submit(&self, order: Order) -> Result<Order, ExecutionError> {
        self.ensure_tradable(&order.symbol).await?;
        let guard = self.acquire_lane(&order.symbol).await?;
        self.run(order, guard).await
    }

    async fn ensure_tradable(&self, symbol: &str) -> Result<(), ExecutionError> {
        if self.is_halted(symbol).await {
            return Err(ExecutionError::SymbolHalted(symbol.to_string()));
        }
        Ok(())
    }

    async fn acquire_lane(&self, symbol: &str) -> Result<OwnedMutexGuard<()>, ExecutionError> {
        let lane_wait = self.config.lane_wait_timeout_ms;
        timeout(
            Duration::from_millis(lane_wait),
            self.lane(symbol).await.lock_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!("⏳ {} lane busy for {}ms; request dropped", symbol, lane_wait);
            ExecutionError::Timeout {
                operation: "lane_wait",
                timeout_ms: lane_wait,
            }
        })
    }

    /// Submits `order` while holding its symbol's lane. The guard is parked until
    /// the order is terminal.
    async fn run(&self, mut order: Order, guard: OwnedMutexGuard<()>) -> Result<Order, ExecutionError> {
        let order_id = order.id.clone();
        order.updated_at = chrono::Utc::now();
        self.lane_guards.lock().await.insert(order_id.clone(), guard);
        self.active.write().await.insert(order_id.clone(), order.clone());
        self.announce(&order);

        let policy = &self.config.retry;
        let mut last_error = String::new();
        for attempt in 1..=policy.max_attempts {
            if self.cancel_requests.lock().await.remove(&order_id) {
                tracing::info!("🚫 Order {} cancelled before submission", order_id.short());
                return self.finish(&order_id, OrderStatus::Cancelled).await;
            }

            let submitted = timeout(
                Duration::from_millis(self.config.submit_timeout_ms),
                self.exchange.submit(&order),
            )
            .await;

            match submitted {
                Ok(Ok(ack)) => {
                    tracing::info!(
                        "📤 Order {} {} {} {:.6} submitted ({})",
                        order_id.short(),
                        order.side,
                        order.symbol,
                        order.requested_qty,
                        ack.exchange_ref
                    );
                    self.mark_submitted(&order_id).await;
                    if self.cancel_requests.lock().await.remove(&order_id) {
                        if let Err(e) = self.cancel(&order_id).await {
                            tracing::warn!("⚠️  Deferred cancel of {} failed: {}", order_id.short(), e);
                        }
                    }
                    return self
                        .order(&order_id)
                        .await
                        .ok_or(ExecutionError::UnknownOrder(order_id));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("submit timed out after {}ms", self.config.submit_timeout_ms)
                }
            }

            order.retry_count = attempt;
            if let Some(active) = self.active.write().await.get_mut(&order_id) {
                active.retry_count = attempt;
            }
            tracing::warn!(
                "🔁 Submit attempt {}/{} for {} failed: {}",
                attempt,
                policy.max_attempts,
                order_id.short(),
                last_error
            );
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }

        let error = ExecutionError::RetriesExhausted {
            order_id: order_id.clone(),
            attempts: policy.max_attempts,
            last_error,
        };
        tracing::error!("❌ {}", error);
        self.events.emit(
            EventKind::ExecutionFailure,
            json!({
                "order_id": order_id,
                "symbol": order.symbol,
                "error": error.to_string(),
            }),
        );
        self.finish(&order_id, OrderStatus::Failed).await?;
        Err(error)
    }

    /// Moves a still-pending order to `Submitted`. Fills that beat the ack already did.
    async fn mark_submitted(&self, order_id: &OrderId) {
        if let Some(order) = self.active.write().await.get_mut(order_id) {
            if order.status == OrderStatus::Pending && order.transition(OrderStatus::Submitted).is_ok() {
                self.announce(order);
            }
        }
    }

    /// Cancels a working order. The order only becomes `Cancelled` when the exchange
    /// confirms; otherwise it keeps its state and `CancelRejected` is returned.
    pub async fn cancel(&self, order_id: &OrderId) -> Result<Order, ExecutionError> {
        let status = match self.active.read().await.get(order_id) {
            Some(order) => order.status,
            None => {
                return match self.archive.read().await.get(order_id) {
                    Some(order) => Err(ExecutionError::InvalidTransition {
                        order_id: order_id.clone(),
                        from: order.status,
                        to: OrderStatus::Cancelled,
                    }),
                    None => Err(ExecutionError::UnknownOrder(order_id.clone())),
                };
            }
        };

        if status == OrderStatus::Pending {
            // Still inside the submit loop; honored between attempts or on ack.
            self.cancel_requests.lock().await.insert(order_id.clone());
            tracing::info!("🚫 Cancel of {} queued until submission settles", order_id.short());
            return self
                .order(order_id)
                .await
                .ok_or_else(|| ExecutionError::UnknownOrder(order_id.clone()));
        }

        let reply = timeout(
            Duration::from_millis(self.config.cancel_timeout_ms),
            self.exchange.cancel(order_id),
        )
        .await;

        match reply {
            Ok(Ok(CancelAck::Confirmed)) => self.finish(order_id, OrderStatus::Cancelled).await,
            Ok(Ok(CancelAck::Rejected)) | Ok(Err(_)) | Err(_) => {
                tracing::warn!("⚠️  Cancel of {} not confirmed; order keeps its state", order_id.short());
                Err(ExecutionError::CancelRejected {
                    order_id: order_id.clone(),
                })
            }
        }
    }

    /// Applies one execution report. Duplicate deliveries are ignored.
    pub async fn on_fill(&self, report: ExchangeFill) -> Result<FillOutcome, EngineError> {
        let key = (report.order_id.clone(), report.sequence);
        // Claimed before the order is touched, so concurrent redeliveries apply once.
        if !self.seen_fills.lock().await.insert(key.clone(), ()) {
            return Ok(FillOutcome::Duplicate);
        }

        let updated = match self.active.write().await.get_mut(&report.order_id) {
            Some(order) => order
                .record_fill(report.quantity, report.price)
                .map(|_| {
                    self.announce(order);
                    Some(order.clone())
                }),
            None => Ok(None),
        };
        let order = match updated {
            Ok(Some(order)) => order,
            Ok(None) => {
                self.seen_fills.lock().await.remove(&key);
                let archived = self.archive.read().await.get(&report.order_id).map(|o| o.status);
                tracing::warn!(
                    "⚠️  Fill {}#{} for inactive order ignored ({:?})",
                    report.order_id.short(),
                    report.sequence,
                    archived
                );
                return Err(match archived {
                    Some(from) => ExecutionError::InvalidTransition {
                        order_id: report.order_id.clone(),
                        from,
                        to: OrderStatus::PartiallyFilled,
                    },
                    None => ExecutionError::UnknownOrder(report.order_id.clone()),
                }
                .into());
            }
            Err(e) => {
                self.seen_fills.lock().await.remove(&key);
                return Err(e.into());
            }
        };

        let fill = Fill {
            order_id: order.id.clone(),
            sequence: report.sequence,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: report.quantity,
            price: report.price,
            intent: order.intent,
            timestamp: report.timestamp,
        };

        let outcome = match self.ledger.apply_fill(&fill).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.persistence_failure(&order.symbol, &e).await;
                if order.status.is_terminal() {
                    self.finish(&order.id, order.status).await?;
                }
                return Err(e.into());
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_fill();
        }

        if order.status.is_terminal() {
            self.finish(&order.id, order.status).await?;
        }
        Ok(outcome)
    }

    async fn persistence_failure(&self, symbol: &str, error: &PersistenceError) {
        self.events.emit(
            EventKind::PersistenceFailure,
            json!({ "symbol": symbol, "error": error.to_string() }),
        );
        self.halt(symbol, &error.to_string()).await;
    }

    /// Puts the order in its terminal state, archives it and frees its lane.
    async fn finish(&self, order_id: &OrderId, status: OrderStatus) -> Result<Order, ExecutionError> {
        let mut order = self
            .active
            .write()
            .await
            .remove(order_id)
            .ok_or_else(|| ExecutionError::UnknownOrder(order_id.clone()))?;

        if order.status != status {
            order.transition(status)?;
            self.announce(&order);
        }

        self.cancel_requests.lock().await.remove(order_id);
        self.lane_guards.lock().await.remove(order_id);
        self.archive.write().await.insert(order_id.clone(), order.clone());

        if let Some(tx) = &self.terminal_tx {
            let _ = tx.send(order.clone());
        }
        Ok(order)
    }

    fn announce(&self, order: &Order) {
        tracing::debug!(
            "📋 Order {} {} -> {}",
            order.id.short(),
            order.symbol,
            order.status.as_str()
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(order.status.as_str());
        }
        self.events.emit(
            EventKind::OrderTransition,
            json!({
                "order_id": order.id,
                "symbol": order.symbol,
                "side": order.side,
                "status": order.status,
                "requested": order.requested_qty,
                "filled": order.filled_qty,
                "retry_count": order.retry_count,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::exchange::{MockExchangeAdapter, OrderAck};
    use crate::execution::order::Side;
    use crate::execution::retry::RetryPolicy;
    use crate::portfolio::store::MockSnapshotStore;
    use crate::portfolio::MemorySnapshotStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                multiplier: 2.0,
                max_backoff_ms: 5,
            },
            submit_timeout_ms: 200,
            cancel_timeout_ms: 200,
            lane_wait_timeout_ms: 30,
            paper_fill_slices: 1,
            history_capacity: 1_000,
        }
    }

    fn accepting() -> MockExchangeAdapter {
        let mut exchange = MockExchangeAdapter::new();
        exchange.expect_submit().returning(|order| {
            Ok(OrderAck {
                order_id: order.id.clone(),
                exchange_ref: "mock".to_string(),
            })
        });
        exchange
    }

    fn manager(exchange: MockExchangeAdapter) -> (OrderManager, Arc<PortfolioLedger>, Arc<EventBus>) {
        manager_with(exchange, config())
    }

    fn manager_with(
        exchange: MockExchangeAdapter,
        config: ExecutionConfig,
    ) -> (OrderManager, Arc<PortfolioLedger>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(256));
        let ledger = Arc::new(PortfolioLedger::new(
            10_000.0,
            Arc::new(MemorySnapshotStore::new()),
            events.clone(),
        ));
        let manager = OrderManager::new(Arc::new(exchange), ledger.clone(), events.clone(), config);
        (manager, ledger, events)
    }

    fn entry_order(symbol: &str, qty: f64) -> Order {
        Order::new(
            symbol,
            Side::Buy,
            qty,
            OrderIntent::Entry {
                stop_loss: 98.0,
                take_profit: 104.0,
            },
        )
    }

    fn report(order_id: &OrderId, sequence: u64, quantity: f64, price: f64) -> ExchangeFill {
        ExchangeFill {
            order_id: order_id.clone(),
            sequence,
            quantity,
            price,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_submit_retries_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut exchange = MockExchangeAdapter::new();
        exchange.expect_submit().returning(move |order| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExecutionError::Exchange("busy".to_string()))
            } else {
                Ok(OrderAck {
                    order_id: order.id.clone(),
                    exchange_ref: "mock".to_string(),
                })
            }
        });
        let (manager, _, _) = manager(exchange);

        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.retry_count, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_order_and_free_lane() {
        let mut exchange = MockExchangeAdapter::new();
        exchange
            .expect_submit()
            .returning(|_| Err(ExecutionError::Exchange("rejected".to_string())));
        let (manager, ledger, events) = manager(exchange);
        let mut rx = events.subscribe();

        let order = entry_order("BTCUSDT", 1.0);
        let order_id = order.id.clone();
        let err = manager.submit(order).await.unwrap_err();
        assert!(matches!(err, ExecutionError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(manager.order(&order_id).await.unwrap().status, OrderStatus::Failed);
        assert!(ledger.position("BTCUSDT").await.is_none());

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind == EventKind::ExecutionFailure {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        // The lane was released, so the next request is not stuck behind it.
        let again = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap_err();
        assert!(matches!(again, ExecutionError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn test_two_partial_fills_complete_order() {
        let (manager, ledger, _) = manager(accepting());
        let order = manager.submit(entry_order("BTCUSDT", 2.0)).await.unwrap();

        manager.on_fill(report(&order.id, 1, 0.75, 100.0)).await.unwrap();
        assert_eq!(
            manager.order(&order.id).await.unwrap().status,
            OrderStatus::PartiallyFilled
        );
        manager.on_fill(report(&order.id, 2, 1.25, 100.0)).await.unwrap();

        let done = manager.order(&order.id).await.unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
        assert!((ledger.filled_quantity(&order.id).await - 2.0).abs() < 1e-9);
        assert!((ledger.position("BTCUSDT").await.unwrap().size - 2.0).abs() < 1e-9);
        assert!(manager.active_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fill_ignored() {
        let (manager, ledger, _) = manager(accepting());
        let order = manager.submit(entry_order("BTCUSDT", 2.0)).await.unwrap();

        let fill = report(&order.id, 1, 1.0, 100.0);
        assert_eq!(manager.on_fill(fill.clone()).await.unwrap(), FillOutcome::Applied);
        assert_eq!(manager.on_fill(fill).await.unwrap(), FillOutcome::Duplicate);
        assert!((ledger.filled_quantity(&order.id).await - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overfill_rejected() {
        let (manager, ledger, _) = manager(accepting());
        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();

        manager.on_fill(report(&order.id, 1, 0.6, 100.0)).await.unwrap();
        let err = manager.on_fill(report(&order.id, 2, 0.6, 100.0)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Execution(ExecutionError::Overfill { .. })
        ));
        assert!((ledger.filled_quantity(&order.id).await - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejected_cancel_keeps_state() {
        let mut exchange = accepting();
        exchange.expect_cancel().returning(|_| Ok(CancelAck::Rejected));
        let (manager, _, _) = manager(exchange);
        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();

        let err = manager.cancel(&order.id).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CancelRejected { .. }));
        assert_eq!(manager.order(&order.id).await.unwrap().status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn test_confirmed_cancel_after_partial_fill() {
        let mut exchange = accepting();
        exchange.expect_cancel().returning(|_| Ok(CancelAck::Confirmed));
        let (manager, ledger, _) = manager(exchange);
        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();
        manager.on_fill(report(&order.id, 1, 0.4, 100.0)).await.unwrap();

        let cancelled = manager.cancel(&order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!((ledger.position("BTCUSDT").await.unwrap().size - 0.4).abs() < 1e-9);

        let late = manager.on_fill(report(&order.id, 2, 0.6, 100.0)).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_same_symbol_queues_other_symbols_proceed() {
        let (manager, _, _) = manager(accepting());
        manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();

        let blocked = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap_err();
        assert!(matches!(
            blocked,
            ExecutionError::Timeout {
                operation: "lane_wait",
                ..
            }
        ));
        assert!(manager.submit(entry_order("ETHUSDT", 1.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistence_failure_halts_symbol() {
        let events = Arc::new(EventBus::new(64));
        let mut store = MockSnapshotStore::new();
        store
            .expect_save()
            .returning(|_, _| Err(PersistenceError::Corrupt("read-only".to_string())));
        let ledger = Arc::new(PortfolioLedger::new(10_000.0, Arc::new(store), events.clone()));
        let manager = OrderManager::new(Arc::new(accepting()), ledger, events, config());

        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();
        let err = manager.on_fill(report(&order.id, 1, 1.0, 100.0)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(manager.is_halted("BTCUSDT").await);
        assert!(!manager.is_halted("ETHUSDT").await);

        let refused = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap_err();
        assert_eq!(refused, ExecutionError::SymbolHalted("BTCUSDT".to_string()));
    }

    #[tokio::test]
    async fn test_stop_loss_triggers_exit_order() {
        let (manager, _, _) = manager(accepting());
        let entry = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();
        manager.on_fill(report(&entry.id, 1, 1.0, 100.0)).await.unwrap();

        assert!(manager.on_price("BTCUSDT", 99.0).await.unwrap().is_none());
        let exit = manager.on_price("BTCUSDT", 97.0).await.unwrap().unwrap();
        assert_eq!(exit.side, Side::Sell);
        assert_eq!(
            exit.intent,
            OrderIntent::Exit {
                reason: ExitReason::StopLoss
            }
        );

        // A second crossing while the exit is working does not stack another order.
        assert!(manager.on_price("BTCUSDT", 96.0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_loss_cancels_resting_entry_then_exits() {
        let mut exchange = accepting();
        exchange.expect_cancel().times(1).returning(|_| Ok(CancelAck::Confirmed));
        let (manager, ledger, _) = manager(exchange);

        let entry = manager.submit(entry_order("BTCUSDT", 2.0)).await.unwrap();
        manager.on_fill(report(&entry.id, 1, 1.0, 100.0)).await.unwrap();
        assert_eq!(
            manager.order(&entry.id).await.unwrap().status,
            OrderStatus::PartiallyFilled
        );

        let exit = manager.on_price("BTCUSDT", 95.0).await.unwrap().unwrap();
        assert_eq!(manager.order(&entry.id).await.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(exit.side, Side::Sell);
        assert!((exit.requested_qty - 1.0).abs() < 1e-9);
        assert_eq!(
            exit.intent,
            OrderIntent::Exit {
                reason: ExitReason::StopLoss
            }
        );

        manager.on_fill(report(&exit.id, 1, 1.0, 95.0)).await.unwrap();
        assert!(ledger.position("BTCUSDT").await.is_none());
        assert!(manager.active_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_redelivery_applies_once() {
        let (manager, ledger, _) = manager(accepting());
        let order = manager.submit(entry_order("BTCUSDT", 2.0)).await.unwrap();
        let fill = report(&order.id, 1, 1.0, 100.0);

        let (a, b) = tokio::join!(manager.on_fill(fill.clone()), manager.on_fill(fill));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == FillOutcome::Duplicate);
        assert_eq!(outcomes, vec![FillOutcome::Applied, FillOutcome::Duplicate]);

        let current = manager.order(&order.id).await.unwrap();
        assert!((current.filled_qty - 1.0).abs() < 1e-9);
        assert!((ledger.filled_quantity(&order.id).await - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_order_history_is_bounded() {
        let (manager, _, _) = manager_with(
            accepting(),
            ExecutionConfig {
                history_capacity: 4,
                ..config()
            },
        );

        let mut last = None;
        for i in 0..10 {
            let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();
            let fill = report(&order.id, 1, 1.0, 100.0 + i as f64);
            manager.on_fill(fill.clone()).await.unwrap();
            last = Some(fill);
        }

        assert_eq!(manager.archive.read().await.len(), 4);
        assert_eq!(manager.seen_fills.lock().await.len(), 4);
        assert_eq!(
            manager.on_fill(last.unwrap()).await.unwrap(),
            FillOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_failed_fill_can_be_redelivered() {
        let (manager, _, _) = manager(accepting());
        let order = manager.submit(entry_order("BTCUSDT", 1.0)).await.unwrap();

        let too_big = report(&order.id, 1, 1.5, 100.0);
        assert!(manager.on_fill(too_big).await.is_err());
        // The rejected key is not remembered; a corrected report with that sequence applies.
        let corrected = report(&order.id, 1, 1.0, 100.0);
        assert_eq!(manager.on_fill(corrected).await.unwrap(), FillOutcome::Applied);
    }
}
