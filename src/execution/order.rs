use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::error::ExecutionError;

/// Quantities closer than this are treated as equal.
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Shutdown,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "Stop Loss"),
            ExitReason::TakeProfit => write!(f, "Take Profit"),
            ExitReason::Shutdown => write!(f, "Shutdown"),
            ExitReason::Manual => write!(f, "Manual"),
        }
    }
}

/// What a fill of this order does to the position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderIntent {
    Entry { stop_loss: f64, take_profit: f64 },
    Exit { reason: ExitReason },
}

impl OrderIntent {
    pub fn is_entry(&self) -> bool {
        matches!(self, OrderIntent::Entry { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Forward-only transitions. `PartiallyFilled -> PartiallyFilled` is allowed
    /// because each partial fill re-enters the state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::PartiallyFilled => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub requested_qty: f64,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub intent: OrderIntent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(symbol: impl Into<String>, side: Side, quantity: f64, intent: OrderIntent) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            symbol: symbol.into(),
            side,
            requested_qty: quantity,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            status: OrderStatus::Pending,
            retry_count: 0,
            intent,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_qty(&self) -> f64 {
        (self.requested_qty - self.filled_qty).max(0.0)
    }

    pub fn transition(&mut self, next: OrderStatus) -> Result<OrderStatus, ExecutionError> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Adds a fill and moves to `PartiallyFilled` or `Filled`.
    /// A fill arriving before the submit acknowledgment implies submission.
    pub fn record_fill(&mut self, quantity: f64, price: f64) -> Result<OrderStatus, ExecutionError> {
        if self.status.is_terminal() && self.status != OrderStatus::Filled {
            return Err(ExecutionError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: OrderStatus::PartiallyFilled,
            });
        }
        if quantity <= 0.0 || self.filled_qty + quantity > self.requested_qty + QTY_EPSILON {
            return Err(ExecutionError::Overfill {
                order_id: self.id.clone(),
                requested: self.requested_qty,
                filled: self.filled_qty,
                fill_qty: quantity,
            });
        }

        let notional = self.avg_fill_price * self.filled_qty + price * quantity;
        self.filled_qty = (self.filled_qty + quantity).min(self.requested_qty);
        self.avg_fill_price = notional / (self.filled_qty.max(QTY_EPSILON));

        let next = if self.remaining_qty() <= QTY_EPSILON {
            self.filled_qty = self.requested_qty;
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn entry() -> OrderIntent {
        OrderIntent::Entry {
            stop_loss: 98.0,
            take_profit: 104.0,
        }
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut order = Order::new("BTCUSDT", Side::Buy, 1.0, entry());
        assert_ok!(order.transition(OrderStatus::Submitted));
        assert_err!(order.transition(OrderStatus::Pending));
        assert_ok!(order.transition(OrderStatus::Cancelled));
        assert_err!(order.transition(OrderStatus::Submitted));
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_partial_fills_then_filled() {
        let mut order = Order::new("BTCUSDT", Side::Buy, 2.0, entry());
        order.transition(OrderStatus::Submitted).unwrap();

        order.record_fill(0.5, 100.0).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        order.record_fill(0.5, 102.0).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        order.record_fill(1.0, 101.0).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_qty, 2.0);
        assert!((order.avg_fill_price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_overfill_rejected_and_state_kept() {
        let mut order = Order::new("BTCUSDT", Side::Sell, 1.0, entry());
        order.transition(OrderStatus::Submitted).unwrap();
        order.record_fill(0.6, 100.0).unwrap();

        let err = order.record_fill(0.6, 100.0).unwrap_err();
        assert!(matches!(err, ExecutionError::Overfill { .. }));
        assert!((order.filled_qty - 0.6).abs() < 1e-12);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_fill_before_ack_implies_submission() {
        let mut order = Order::new("BTCUSDT", Side::Buy, 1.0, entry());
        order.record_fill(1.0, 100.0).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_cancelled_order_rejects_fills() {
        let mut order = Order::new("BTCUSDT", Side::Buy, 1.0, entry());
        order.transition(OrderStatus::Submitted).unwrap();
        order.transition(OrderStatus::Cancelled).unwrap();
        assert_err!(order.record_fill(0.5, 100.0));
    }
}
