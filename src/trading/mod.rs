pub mod orchestrator;
pub mod risk_manager;

pub use orchestrator::{EngineHandle, TickOutcome, TradingEngine};
pub use risk_manager::{ApprovedOrder, BlockReason, RiskConfig, RiskDecision, RiskManager, RiskState};
