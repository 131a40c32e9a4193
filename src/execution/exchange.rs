use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::order::{Order, OrderId};
use crate::core::error::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub exchange_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// No further fills will arrive for the order.
    Confirmed,
    /// The exchange could not guarantee the order is dead.
    Rejected,
}

/// Execution report from the exchange. `sequence` is unique per order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFill {
    pub order_id: OrderId,
    pub sequence: u64,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

pub type FillSender = mpsc::UnboundedSender<ExchangeFill>;
pub type FillStream = mpsc::UnboundedReceiver<ExchangeFill>;

pub fn fill_channel() -> (FillSender, FillStream) {
    mpsc::unbounded_channel()
}

/// Venue connectivity. Fills are delivered out of band on the adapter's fill stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn submit(&self, order: &Order) -> Result<OrderAck, ExecutionError>;
    async fn cancel(&self, order_id: &OrderId) -> Result<CancelAck, ExecutionError>;
}

/// Simulated venue that fills every order at the last seen price.
pub struct PaperExchange {
    prices: RwLock<HashMap<String, f64>>,
    working: Arc<Mutex<HashSet<OrderId>>>,
    fill_slices: u32,
    fills: FillSender,
}

impl PaperExchange {
    pub fn new(fills: FillSender, fill_slices: u32) -> Self {
        tracing::info!(
            "✅ Paper exchange enabled - orders are simulated ({} fill slice(s))",
            fill_slices.max(1)
        );
        Self {
            prices: RwLock::new(HashMap::new()),
            working: Arc::new(Mutex::new(HashSet::new())),
            fill_slices: fill_slices.max(1),
            fills,
        }
    }

    pub async fn update_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn submit(&self, order: &Order) -> Result<OrderAck, ExecutionError> {
        let price = self
            .prices
            .read()
            .await
            .get(&order.symbol)
            .copied()
            .ok_or_else(|| ExecutionError::Exchange(format!("no price for {}", order.symbol)))?;

        let order_id = order.id.clone();
        self.working.lock().await.insert(order_id.clone());

        let slices = self.fill_slices;
        let slice_qty = order.remaining_qty() / slices as f64;
        let mut remaining = order.remaining_qty();
        let working = self.working.clone();
        let fills = self.fills.clone();

        tracing::info!(
            "🔸 PAPER: {} {} {:.6} @ {:.4} accepted",
            order.side,
            order.symbol,
            order.requested_qty,
            price
        );

        tokio::spawn(async move {
            for sequence in 1..=slices as u64 {
                tokio::task::yield_now().await;
                if !working.lock().await.contains(&order_id) {
                    return;
                }
                let quantity = if sequence == slices as u64 {
                    remaining
                } else {
                    slice_qty
                };
                remaining -= quantity;
                let fill = ExchangeFill {
                    order_id: order_id.clone(),
                    sequence,
                    quantity,
                    price,
                    timestamp: Utc::now(),
                };
                if fills.send(fill).is_err() {
                    tracing::warn!("⚠️  Fill stream closed; paper order {} abandoned", order_id.short());
                    return;
                }
            }
            working.lock().await.remove(&order_id);
        });

        Ok(OrderAck {
            exchange_ref: format!("paper-{}", order.id.short()),
            order_id: order.id.clone(),
        })
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<CancelAck, ExecutionError> {
        if self.working.lock().await.remove(order_id) {
            Ok(CancelAck::Confirmed)
        } else {
            Ok(CancelAck::Rejected)
        }
    }
}
