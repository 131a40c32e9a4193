pub mod ledger;
pub mod position;
pub mod store;

pub use ledger::{Fill, FillOutcome, PortfolioLedger, PortfolioState, TradeStats};
pub use position::{Position, PositionRisk, PositionSide};
pub use store::{
    FillKey, LedgerSnapshot, MemorySnapshotStore, RestoredLedger, SnapshotStore, SqliteSnapshotStore,
};
