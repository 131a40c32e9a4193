use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::order::{ExitReason, Side};
use crate::strategy::Action;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Long => Some(PositionSide::Long),
            Action::Short => Some(PositionSide::Short),
            Action::Flat => None,
        }
    }

    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }

    /// Order side that grows this position.
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

/// Risk/reward figures derived from the protective levels of a position.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PositionRisk {
    pub risk_amount: f64,
    pub reward_amount: f64,
    pub risk_reward_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            entry_price,
            current_price: entry_price,
            stop_loss,
            take_profit,
            unrealized_pnl: 0.0,
            opened_at,
        }
    }

    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price, self.size);
    }

    /// PnL of `quantity` units if closed at `price`.
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        (price - self.entry_price) * quantity * self.side.sign()
    }

    /// Adds to the position at `price`, moving the entry to the size-weighted average.
    pub fn increase(&mut self, quantity: f64, price: f64) {
        let total = self.size + quantity;
        if total > 0.0 {
            self.entry_price = (self.entry_price * self.size + price * quantity) / total;
        }
        self.size = total;
        self.update_price(price);
    }

    /// Removes up to `quantity` units at `price` and returns the realized PnL.
    pub fn reduce(&mut self, quantity: f64, price: f64) -> f64 {
        let closed = quantity.min(self.size);
        let realized = self.pnl_at(price, closed);
        self.size -= closed;
        self.update_price(price);
        realized
    }

    pub fn notional(&self) -> f64 {
        self.size * self.current_price
    }

    pub fn should_close(&self) -> bool {
        self.close_reason().is_some()
    }

    pub fn close_reason(&self) -> Option<ExitReason> {
        let price = self.current_price;
        match self.side {
            PositionSide::Long => {
                if self.stop_loss > 0.0 && price <= self.stop_loss {
                    Some(ExitReason::StopLoss)
                } else if self.take_profit > 0.0 && price >= self.take_profit {
                    Some(ExitReason::TakeProfit)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if self.stop_loss > 0.0 && price >= self.stop_loss {
                    Some(ExitReason::StopLoss)
                } else if self.take_profit > 0.0 && price <= self.take_profit {
                    Some(ExitReason::TakeProfit)
                } else {
                    None
                }
            }
        }
    }

    pub fn risk(&self) -> PositionRisk {
        let risk_amount = (self.entry_price - self.stop_loss).abs() * self.size;
        let reward_amount = (self.take_profit - self.entry_price).abs() * self.size;
        let risk_reward_ratio = if risk_amount > 0.0 {
            reward_amount / risk_amount
        } else {
            0.0
        };
        PositionRisk {
            risk_amount,
            reward_amount,
            risk_reward_ratio,
        }
    }
}
