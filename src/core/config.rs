use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::ConfigError;
use crate::ai::consensus::FusionPolicy;
use crate::execution::retry::RetryPolicy;
use crate::trading::risk_manager::RiskConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub data: DataConfig,
    pub ensemble: EnsembleConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub ledger: LedgerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub staleness_threshold_ms: u64,
    /// JSON-lines snapshot file replayed by the binary.
    pub replay_path: Option<String>,
    pub replay_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub quorum: usize,
    pub fusion_policy: FusionPolicy,
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    PolicyGradient,
    Sentiment,
    Regime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub kind: ModelKind,
    /// Trained artifact (JSON). Built-in parameters are used when absent.
    #[serde(default)]
    pub artifact: Option<String>,
    pub weight: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub retry: RetryPolicy,
    pub submit_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
    /// How long a request may queue behind the in-flight order of its symbol.
    pub lane_wait_timeout_ms: u64,
    /// Number of partial fills the paper exchange splits each order into.
    pub paper_fill_slices: u32,
    /// Terminal orders and fill keys kept for lookups and deduplication.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub initial_equity: f64,
    /// SQLite file for portfolio snapshots. In-memory store when absent.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub health_port: u16,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            data: DataConfig::default(),
            ensemble: EnsembleConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            ledger: LedgerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 5000,
            replay_path: None,
            replay_interval_ms: 100,
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            quorum: 2,
            fusion_policy: FusionPolicy::ConfidenceWeighted,
            models: vec![
                ModelConfig {
                    id: "policy_gradient".to_string(),
                    kind: ModelKind::PolicyGradient,
                    artifact: None,
                    weight: 0.6,
                    timeout_ms: 250,
                },
                ModelConfig {
                    id: "sentiment".to_string(),
                    kind: ModelKind::Sentiment,
                    artifact: None,
                    weight: 0.2,
                    timeout_ms: 250,
                },
                ModelConfig {
                    id: "regime".to_string(),
                    kind: ModelKind::Regime,
                    artifact: None,
                    weight: 0.2,
                    timeout_ms: 250,
                },
            ],
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            submit_timeout_ms: 2000,
            cancel_timeout_ms: 2000,
            lane_wait_timeout_ms: 10_000,
            paper_fill_slices: 1,
            history_capacity: 50_000,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_equity: 10_000.0,
            database_path: None,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            health_port: 3000,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Layers an optional TOML/JSON file and `ENGINE__*` environment variables
    /// over the defaults, then validates the result.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(invalid("at least one symbol is required"));
        }
        if self.data.staleness_threshold_ms == 0 {
            return Err(invalid("data.staleness_threshold_ms must be > 0"));
        }

        let models = &self.ensemble.models;
        if models.is_empty() {
            return Err(invalid("ensemble.models must not be empty"));
        }
        if self.ensemble.quorum == 0 || self.ensemble.quorum > models.len() {
            return Err(invalid(&format!(
                "ensemble.quorum must be in 1..={} (got {})",
                models.len(),
                self.ensemble.quorum
            )));
        }
        let mut seen = HashSet::new();
        for model in models {
            if !seen.insert(model.id.as_str()) {
                return Err(invalid(&format!("duplicate model id '{}'", model.id)));
            }
            if !model.weight.is_finite() || model.weight <= 0.0 {
                return Err(invalid(&format!(
                    "model '{}' weight must be positive",
                    model.id
                )));
            }
            if model.timeout_ms == 0 {
                return Err(invalid(&format!(
                    "model '{}' timeout_ms must be > 0",
                    model.id
                )));
            }
        }

        self.risk.validate().map_err(|reason| invalid(&reason))?;

        if self.execution.retry.max_attempts == 0 {
            return Err(invalid("execution.retry.max_attempts must be >= 1"));
        }
        if self.execution.retry.multiplier < 1.0 {
            return Err(invalid("execution.retry.multiplier must be >= 1.0"));
        }
        if self.execution.paper_fill_slices == 0 {
            return Err(invalid("execution.paper_fill_slices must be >= 1"));
        }
        if self.execution.history_capacity == 0 {
            return Err(invalid("execution.history_capacity must be >= 1"));
        }
        if !self.ledger.initial_equity.is_finite() || self.ledger.initial_equity <= 0.0 {
            return Err(invalid("ledger.initial_equity must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid(reason.to_string())
}
