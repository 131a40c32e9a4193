pub mod bounded;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;

pub use bounded::BoundedMap;
pub use config::EngineConfig;
pub use error::{
    ConfigError, DataError, EngineError, ExecutionError, FusionError, PersistenceError,
};
pub use health::HealthChecker;
