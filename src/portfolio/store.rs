use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tokio::sync::Mutex;

use super::ledger::TradeStats;
use super::position::{Position, PositionSide};
use crate::core::error::PersistenceError;
use crate::core::BoundedMap;
use crate::execution::order::OrderId;

/// Applied-fill keys remembered for deduplication, in memory and on disk.
pub const APPLIED_FILL_MEMORY: usize = 50_000;

/// Identifies one fill delivery; a fill is applied at most once per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillKey {
    pub order_id: OrderId,
    pub sequence: u64,
}

/// Portfolio state needed to rebuild the ledger after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub positions: Vec<Position>,
    pub cash: f64,
    pub realized_pnl: f64,
    pub peak_equity: f64,
    pub daily_trades: u32,
    pub trading_day: NaiveDate,
    pub trade_stats: TradeStats,
    pub saved_at: DateTime<Utc>,
}

/// What a store hands back on startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredLedger {
    pub snapshot: LedgerSnapshot,
    /// Most recent applied-fill keys, oldest first.
    pub applied_fills: Vec<FillKey>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replaces the stored snapshot and appends `new_fills`, the keys applied since
    /// the previous save, in one atomic step.
    async fn save(&self, snapshot: &LedgerSnapshot, new_fills: &[FillKey]) -> Result<(), PersistenceError>;
    async fn load(&self) -> Result<Option<RestoredLedger>, PersistenceError>;
}

struct MemoryState {
    latest: Option<LedgerSnapshot>,
    applied: BoundedMap<FillKey, ()>,
}

pub struct MemorySnapshotStore {
    state: Mutex<MemoryState>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                latest: None,
                applied: BoundedMap::new(APPLIED_FILL_MEMORY),
            }),
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &LedgerSnapshot, new_fills: &[FillKey]) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.latest = Some(snapshot.clone());
        for key in new_fills {
            state.applied.insert(key.clone(), ());
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<RestoredLedger>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state.latest.clone().map(|snapshot| RestoredLedger {
            snapshot,
            applied_fills: state.applied.keys().cloned().collect(),
        }))
    }
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    symbol: String,
    side: String,
    size: f64,
    entry_price: f64,
    current_price: f64,
    stop_loss: f64,
    take_profit: f64,
    opened_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = PersistenceError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let side = match row.side.as_str() {
            "long" => PositionSide::Long,
            "short" => PositionSide::Short,
            other => {
                return Err(PersistenceError::Corrupt(format!(
                    "{}: unknown side '{}'",
                    row.symbol, other
                )))
            }
        };
        let mut position = Position::open(
            row.symbol,
            side,
            row.size,
            row.entry_price,
            row.stop_loss,
            row.take_profit,
            row.opened_at,
        );
        position.update_price(row.current_price);
        Ok(position)
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    cash: f64,
    realized_pnl: f64,
    peak_equity: f64,
    daily_trades: i64,
    trading_day: NaiveDate,
    wins: i64,
    losses: i64,
    gross_profit: f64,
    gross_loss: f64,
    saved_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct FillKeyRow {
    order_id: String,
    sequence: i64,
}

/// Durable ledger snapshots in SQLite. Each save replaces the previous snapshot and
/// appends the new fill keys atomically; keys beyond `APPLIED_FILL_MEMORY` are pruned.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub async fn new(database_path: &str) -> Result<Self, PersistenceError> {
        let in_memory = database_path.contains(":memory:");
        if !in_memory && !database_path.starts_with("sqlite:") {
            if let Some(parent) = Path::new(database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
                }
            }
        }

        let connection_string = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", database_path)
        };

        // An in-memory database lives per connection, so it gets exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect(&connection_string)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                opened_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cash REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                peak_equity REAL NOT NULL,
                daily_trades INTEGER NOT NULL,
                trading_day DATE NOT NULL,
                wins INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                gross_profit REAL NOT NULL DEFAULT 0,
                gross_loss REAL NOT NULL DEFAULT 0,
                saved_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied_fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                UNIQUE(order_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("✅ Snapshot store schema initialized");
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &LedgerSnapshot, new_fills: &[FillKey]) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM positions").execute(&mut *tx).await?;
        for position in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO positions (
                    symbol, side, size, entry_price, current_price,
                    stop_loss, take_profit, opened_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&position.symbol)
            .bind(position.side.as_str())
            .bind(position.size)
            .bind(position.entry_price)
            .bind(position.current_price)
            .bind(position.stop_loss)
            .bind(position.take_profit)
            .bind(position.opened_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO ledger_state (
                id, cash, realized_pnl, peak_equity, daily_trades, trading_day,
                wins, losses, gross_profit, gross_loss, saved_at
            )
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                cash = excluded.cash,
                realized_pnl = excluded.realized_pnl,
                peak_equity = excluded.peak_equity,
                daily_trades = excluded.daily_trades,
                trading_day = excluded.trading_day,
                wins = excluded.wins,
                losses = excluded.losses,
                gross_profit = excluded.gross_profit,
                gross_loss = excluded.gross_loss,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(snapshot.cash)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.peak_equity)
        .bind(snapshot.daily_trades as i64)
        .bind(snapshot.trading_day)
        .bind(snapshot.trade_stats.wins as i64)
        .bind(snapshot.trade_stats.losses as i64)
        .bind(snapshot.trade_stats.gross_profit)
        .bind(snapshot.trade_stats.gross_loss)
        .bind(snapshot.saved_at)
        .execute(&mut *tx)
        .await?;

        for key in new_fills {
            sqlx::query("INSERT OR IGNORE INTO applied_fills (order_id, sequence) VALUES (?, ?)")
                .bind(&key.order_id.0)
                .bind(key.sequence as i64)
                .execute(&mut *tx)
                .await?;
        }
        if !new_fills.is_empty() {
            sqlx::query(
                "DELETE FROM applied_fills WHERE id <= (SELECT MAX(id) FROM applied_fills) - ?",
            )
            .bind(APPLIED_FILL_MEMORY as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<RestoredLedger>, PersistenceError> {
        let state = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT cash, realized_pnl, peak_equity, daily_trades, trading_day,
                   wins, losses, gross_profit, gross_loss, saved_at
            FROM ledger_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(state) = state else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT symbol, side, size, entry_price, current_price,
                   stop_loss, take_profit, opened_at
            FROM positions ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let positions = rows
            .into_iter()
            .map(Position::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let count = |name: &str, value: i64| {
            u32::try_from(value).map_err(|_| PersistenceError::Corrupt(format!("{} {}", name, value)))
        };

        let applied_fills = sqlx::query_as::<_, FillKeyRow>(
            "SELECT order_id, sequence FROM applied_fills ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            let sequence = u64::try_from(row.sequence)
                .map_err(|_| PersistenceError::Corrupt(format!("fill sequence {}", row.sequence)))?;
            Ok(FillKey {
                order_id: OrderId(row.order_id),
                sequence,
            })
        })
        .collect::<Result<Vec<_>, PersistenceError>>()?;

        Ok(Some(RestoredLedger {
            snapshot: LedgerSnapshot {
                positions,
                cash: state.cash,
                realized_pnl: state.realized_pnl,
                peak_equity: state.peak_equity,
                daily_trades: count("daily_trades", state.daily_trades)?,
                trading_day: state.trading_day,
                trade_stats: TradeStats {
                    wins: count("wins", state.wins)?,
                    losses: count("losses", state.losses)?,
                    gross_profit: state.gross_profit,
                    gross_loss: state.gross_loss,
                },
                saved_at: state.saved_at,
            },
            applied_fills,
        }))
    }
}
