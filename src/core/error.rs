use thiserror::Error;

use crate::execution::order::{OrderId, OrderStatus};

/// Market data could not be turned into a feature vector; the tick is skipped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    #[error("stale data for {symbol}: {age_ms}ms old (threshold {threshold_ms}ms)")]
    StaleData {
        symbol: String,
        age_ms: i64,
        threshold_ms: u64,
    },

    #[error("{symbol}: field '{field}' missing for more than one tick")]
    MissingField { symbol: String, field: &'static str },

    #[error("{symbol}: invalid price {price}")]
    InvalidPrice { symbol: String, price: f64 },
}

/// Fewer models than the quorum answered in time.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("quorum not met: {responded}/{configured} models responded (quorum {quorum})")]
pub struct FusionError {
    pub responded: usize,
    pub configured: usize,
    pub quorum: usize,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("order {order_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        order_id: OrderId,
        attempts: u32,
        last_error: String,
    },

    #[error("cancel rejected for order {order_id}: exchange may still fill it")]
    CancelRejected { order_id: OrderId },

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("order {order_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {order_id}: fill of {fill_qty} would exceed requested {requested} (filled {filled})")]
    Overfill {
        order_id: OrderId,
        requested: f64,
        filled: f64,
        fill_qty: f64,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("trading halted for {0}")]
    SymbolHalted(String),

    #[error("exchange error: {0}")]
    Exchange(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

/// Startup-time failures. Any of these stops the engine.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("model artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("model artifact {path} malformed: {reason}")]
    ArtifactMalformed { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Fatal errors need operator intervention; everything else is recovered per tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let stale = EngineError::from(DataError::StaleData {
            symbol: "BTCUSDT".to_string(),
            age_ms: 9000,
            threshold_ms: 5000,
        });
        assert!(!stale.is_fatal());

        let corrupt = EngineError::from(PersistenceError::Corrupt("bad row".to_string()));
        assert!(corrupt.is_fatal());
    }

    #[test]
    fn test_fusion_error_message() {
        let err = FusionError {
            responded: 2,
            configured: 4,
            quorum: 3,
        };
        assert_eq!(
            err.to_string(),
            "quorum not met: 2/4 models responded (quorum 3)"
        );
    }
}
