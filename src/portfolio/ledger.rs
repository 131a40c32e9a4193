use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::position::{Position, PositionSide};
use super::store::{FillKey, LedgerSnapshot, SnapshotStore, APPLIED_FILL_MEMORY};
use crate::core::error::PersistenceError;
use crate::core::BoundedMap;
use crate::execution::order::{OrderId, OrderIntent, Side, QTY_EPSILON};
use crate::monitoring::{EventBus, EventKind};

/// A quantity executed by the exchange against one order.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub sequence: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub intent: OrderIntent,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    pub fn key(&self) -> FillKey {
        FillKey {
            order_id: self.order_id.clone(),
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Applied,
    Duplicate,
}

/// Win/loss record of realizing fills, the input to Kelly sizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub wins: u32,
    pub losses: u32,
    pub gross_profit: f64,
    /// Sum of losing amounts, kept positive.
    pub gross_loss: f64,
}

impl TradeStats {
    pub fn record(&mut self, pnl: f64) {
        if !pnl.is_finite() {
            return;
        }
        if pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += pnl;
        } else if pnl < 0.0 {
            self.losses += 1;
            self.gross_loss += -pnl;
        }
    }

    pub fn trades(&self) -> u32 {
        self.wins + self.losses
    }

    /// Kelly fraction `W - (1 - W) / R`, where `W` is the win rate and `R` the ratio of
    /// average win to average loss. `None` until at least one win and one loss exist.
    pub fn kelly_fraction(&self) -> Option<f64> {
        if self.wins == 0 || self.losses == 0 || self.gross_loss <= 0.0 {
            return None;
        }
        let win_rate = self.wins as f64 / self.trades() as f64;
        let avg_win = self.gross_profit / self.wins as f64;
        let avg_loss = self.gross_loss / self.losses as f64;
        let ratio = avg_win / avg_loss;
        Some(win_rate - (1.0 - win_rate) / ratio)
    }
}

/// Read-only view of the portfolio handed to the risk manager.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioState {
    pub positions: HashMap<String, Position>,
    pub cash: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub open_trades: usize,
    pub daily_trades: u32,
    pub trading_day: NaiveDate,
    pub trade_stats: TradeStats,
}

impl PortfolioState {
    pub fn new(initial_equity: f64, now: DateTime<Utc>) -> Self {
        Self {
            positions: HashMap::new(),
            cash: initial_equity,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            equity: initial_equity,
            peak_equity: initial_equity,
            drawdown: 0.0,
            open_trades: 0,
            daily_trades: 0,
            trading_day: now.date_naive(),
            trade_stats: TradeStats::default(),
        }
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn exposure(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.notional()).unwrap_or(0.0)
    }

    fn recompute(&mut self) {
        self.unrealized_pnl = self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.equity = self.cash + self.unrealized_pnl;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        self.drawdown = if self.peak_equity > 0.0 {
            ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
        } else {
            0.0
        };
        self.open_trades = self.positions.len();
    }

    fn roll_day(&mut self, at: DateTime<Utc>) {
        let day = at.date_naive();
        if day > self.trading_day {
            tracing::info!(
                "📅 New trading day {} ({} trades on {})",
                day,
                self.daily_trades,
                self.trading_day
            );
            self.trading_day = day;
            self.daily_trades = 0;
        }
    }
}

struct LedgerState {
    portfolio: PortfolioState,
    applied: BoundedMap<FillKey, ()>,
    order_fills: BoundedMap<OrderId, f64>,
}

impl LedgerState {

    fn to_snapshot(&self) -> LedgerSnapshot {
        let mut positions: Vec<Position> = self.portfolio.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        LedgerSnapshot {
            positions,
            cash: self.portfolio.cash,
            realized_pnl: self.portfolio.realized_pnl,
            peak_equity: self.portfolio.peak_equity,
            daily_trades: self.portfolio.daily_trades,
            trading_day: self.portfolio.trading_day,
            trade_stats: self.portfolio.trade_stats.clone(),
            saved_at: Utc::now(),
        }
    }
}

/// Source of truth for positions, cash and equity.
///
/// Fills are applied under one write lock and persisted before the lock is released,
/// so a reader never sees a state the store does not also hold. Each save carries only
/// the fill key it added; the store appends it to what it already holds.
pub struct PortfolioLedger {
    state: RwLock<LedgerState>,
    store: Arc<dyn SnapshotStore>,
    events: Arc<EventBus>,
}

impl PortfolioLedger {
    pub fn new(initial_equity: f64, store: Arc<dyn SnapshotStore>, events: Arc<EventBus>) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                portfolio: PortfolioState::new(initial_equity, Utc::now()),
                applied: BoundedMap::new(APPLIED_FILL_MEMORY),
                order_fills: BoundedMap::new(APPLIED_FILL_MEMORY),
            }),
            store,
            events,
        }
    }

    /// Rebuilds the ledger from the latest snapshot, or starts fresh when there is none.
    pub async fn restore(
        initial_equity: f64,
        store: Arc<dyn SnapshotStore>,
        events: Arc<EventBus>,
    ) -> Result<Self, PersistenceError> {
        let ledger = Self::new(initial_equity, store.clone(), events);
        if let Some(restored) = store.load().await? {
            let snapshot = restored.snapshot;
            let mut state = ledger.state.write().await;
            let portfolio = &mut state.portfolio;
            portfolio.positions = snapshot
                .positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect();
            portfolio.cash = snapshot.cash;
            portfolio.realized_pnl = snapshot.realized_pnl;
            portfolio.peak_equity = snapshot.peak_equity;
            portfolio.daily_trades = snapshot.daily_trades;
            portfolio.trading_day = snapshot.trading_day;
            portfolio.trade_stats = snapshot.trade_stats;
            portfolio.recompute();
            for key in restored.applied_fills {
                state.applied.insert(key, ());
            }
            tracing::info!(
                "♻️  Ledger restored: {} positions, equity ${:.2}",
                state.portfolio.open_trades,
                state.portfolio.equity
            );
        }
        Ok(ledger)
    }

    pub async fn snapshot(&self) -> PortfolioState {
        self.state.read().await.portfolio.clone()
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.state.read().await.portfolio.positions.get(symbol).cloned()
    }

    /// Quantity the ledger has applied for `order_id` in this session.
    pub async fn filled_quantity(&self, order_id: &OrderId) -> f64 {
        self.state
            .read()
            .await
            .order_fills
            .get(order_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Applies a fill exactly once and persists the result.
    ///
    /// On a persistence failure the in-memory state still reflects the fill, since the
    /// exchange already executed it; the caller halts the symbol.
    pub async fn apply_fill(&self, fill: &Fill) -> Result<FillOutcome, PersistenceError> {
        let mut state = self.state.write().await;
        let key = fill.key();
        if state.applied.contains_key(&key) {
            tracing::debug!(
                "🔁 Duplicate fill {}#{} ignored",
                fill.order_id.short(),
                fill.sequence
            );
            return Ok(FillOutcome::Duplicate);
        }

        state.portfolio.roll_day(fill.timestamp);
        apply_to_portfolio(&mut state.portfolio, fill);
        state.portfolio.recompute();
        state.applied.insert(key.clone(), ());
        match state.order_fills.get_mut(&fill.order_id) {
            Some(filled) => *filled += fill.quantity,
            None => {
                state.order_fills.insert(fill.order_id.clone(), fill.quantity);
            }
        }

        let payload = json!({
            "order_id": fill.order_id,
            "sequence": fill.sequence,
            "symbol": fill.symbol,
            "side": fill.side,
            "quantity": fill.quantity,
            "price": fill.price,
            "equity": state.portfolio.equity,
        });

        let snapshot = state.to_snapshot();
        self.store.save(&snapshot, std::slice::from_ref(&key)).await?;
        drop(state);

        self.events.emit(EventKind::FillApplied, payload);
        Ok(FillOutcome::Applied)
    }

    /// Marks open positions to `price` and returns the refreshed portfolio.
    pub async fn mark_price(&self, symbol: &str, price: f64) -> PortfolioState {
        let mut state = self.state.write().await;
        if let Some(position) = state.portfolio.positions.get_mut(symbol) {
            position.update_price(price);
        }
        state.portfolio.roll_day(Utc::now());
        state.portfolio.recompute();
        state.portfolio.clone()
    }

    /// Rebases the peak to current equity once a drawdown breaker is cleared.
    pub async fn reset_peak(&self) {
        let mut state = self.state.write().await;
        state.portfolio.peak_equity = state.portfolio.equity;
        state.portfolio.drawdown = 0.0;
    }

    pub async fn checkpoint(&self) -> Result<(), PersistenceError> {
        let snapshot = self.state.read().await.to_snapshot();
        self.store.save(&snapshot, &[]).await
    }
}

fn apply_to_portfolio(portfolio: &mut PortfolioState, fill: &Fill) {
    let fill_side = PositionSide::from_side(fill.side);
    let mut remaining = fill.quantity;

    if let Some(position) = portfolio.positions.get_mut(&fill.symbol) {
        if position.side == fill_side {
            if fill.intent.is_entry() {
                position.increase(remaining, fill.price);
            } else {
                tracing::warn!(
                    "⚠️  Exit fill for {} on the same side as the position; ignored",
                    fill.symbol
                );
            }
            return;
        }

        let closed = remaining.min(position.size);
        let realized = position.reduce(closed, fill.price);
        let flat = position.size <= QTY_EPSILON;
        remaining -= closed;
        portfolio.cash += realized;
        portfolio.realized_pnl += realized;
        portfolio.trade_stats.record(realized);

        if flat {
            portfolio.positions.remove(&fill.symbol);
            tracing::info!(
                "🔒 Closed {} position, realized ${:.2}",
                fill.symbol,
                realized
            );
        }
    }

    if remaining <= QTY_EPSILON {
        return;
    }

    match fill.intent {
        OrderIntent::Entry {
            stop_loss,
            take_profit,
        } => {
            let position = Position::open(
                &fill.symbol,
                fill_side,
                remaining,
                fill.price,
                stop_loss,
                take_profit,
                fill.timestamp,
            );
            tracing::info!(
                "📈 Opened {} {} {:.6} @ {:.4}",
                fill.symbol,
                fill_side.as_str(),
                remaining,
                fill.price
            );
            portfolio.positions.insert(fill.symbol.clone(), position);
            portfolio.daily_trades += 1;
        }
        OrderIntent::Exit { .. } => {
            tracing::warn!(
                "⚠️  Exit fill for {} exceeds position by {:.6}; remainder ignored",
                fill.symbol,
                remaining
            );
        }
    }
}
