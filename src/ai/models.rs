use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::model::{ModelSlot, PredictiveModel};
use crate::core::config::{ModelConfig, ModelKind};
use crate::core::error::ConfigError;
use crate::strategy::{Action, FeatureVector, ModelSignal, FEATURE_NAMES};

/// Policy inputs: every feature except the raw close price.
const POLICY_INPUTS: usize = FEATURE_NAMES.len() - 1;

/// On-disk model artifact produced by the training pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum ModelArtifact {
    PolicyGradient(PolicyParams),
    Sentiment(SentimentParams),
    Regime(RegimeParams),
}

impl ModelArtifact {
    fn kind(&self) -> ModelKind {
        match self {
            ModelArtifact::PolicyGradient(_) => ModelKind::PolicyGradient,
            ModelArtifact::Sentiment(_) => ModelKind::Sentiment,
            ModelArtifact::Regime(_) => ModelKind::Regime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyParams {
    /// Rows: long, short, flat. Columns: `FEATURE_NAMES[1..]`.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl Default for PolicyParams {
    fn default() -> Self {
        // return_1, range_pct, sma20_gap, sma50_gap, rsi14, bollinger_pos,
        // volatility, volume_ratio, sentiment
        Self {
            weights: vec![
                vec![40.0, 0.0, 25.0, 10.0, 1.0, 0.5, 0.0, 0.1, 0.5],
                vec![-40.0, 0.0, -25.0, -10.0, -1.0, -0.5, 0.0, 0.1, -0.5],
                vec![0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 30.0, 0.0, 0.0],
            ],
            bias: vec![-0.5, 0.5, 0.3],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentParams {
    /// Scores with magnitude below this are neutral.
    pub neutral_band: f64,
    pub scale: f64,
}

impl Default for SentimentParams {
    fn default() -> Self {
        Self {
            neutral_band: 0.15,
            scale: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeParams {
    /// Return volatility at or above which the regime is "high volatility".
    pub high_volatility: f64,
    /// Minimum SMA gap for a trend to count.
    pub trend_threshold: f64,
}

impl Default for RegimeParams {
    fn default() -> Self {
        Self {
            high_volatility: 0.04,
            trend_threshold: 0.002,
        }
    }
}

/// Linear softmax policy trained with policy gradients.
pub struct PolicyGradientModel {
    id: String,
    params: PolicyParams,
}

impl PolicyGradientModel {
    pub fn new(id: impl Into<String>, params: PolicyParams) -> Result<Self, String> {
        if params.weights.len() != 3 || params.bias.len() != 3 {
            return Err("policy needs 3 weight rows and 3 biases".to_string());
        }
        if params.weights.iter().any(|row| row.len() != POLICY_INPUTS) {
            return Err(format!("each weight row needs {} inputs", POLICY_INPUTS));
        }
        Ok(Self {
            id: id.into(),
            params,
        })
    }

    fn probabilities(&self, inputs: &[f64]) -> [f64; 3] {
        let mut logits = [0.0; 3];
        for (i, row) in self.params.weights.iter().enumerate() {
            logits[i] = self.params.bias[i]
                + row.iter().zip(inputs).map(|(w, x)| w * x).sum::<f64>();
        }
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps = logits.map(|l| (l - max).exp());
        let total: f64 = exps.iter().sum();
        exps.map(|e| e / total)
    }
}

#[async_trait]
impl PredictiveModel for PolicyGradientModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, features: &FeatureVector) -> anyhow::Result<ModelSignal> {
        let inputs = &features.values()[1..];
        if inputs.iter().any(|x| !x.is_finite()) {
            anyhow::bail!("non-finite feature for {}", features.symbol);
        }

        let probs = self.probabilities(inputs);
        let actions = [Action::Long, Action::Short, Action::Flat];
        let (best, confidence) = probs
            .iter()
            .enumerate()
            .fold((2, f64::MIN), |acc, (i, p)| if *p > acc.1 { (i, *p) } else { acc });

        Ok(ModelSignal::new(&self.id, actions[best], confidence))
    }
}

/// Maps the auxiliary sentiment score onto an action.
pub struct SentimentModel {
    id: String,
    params: SentimentParams,
}

impl SentimentModel {
    pub fn new(id: impl Into<String>, params: SentimentParams) -> Result<Self, String> {
        if !(params.neutral_band > 0.0 && params.neutral_band < 1.0) {
            return Err("neutral_band must be in (0, 1)".to_string());
        }
        Ok(Self {
            id: id.into(),
            params,
        })
    }
}

#[async_trait]
impl PredictiveModel for SentimentModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, features: &FeatureVector) -> anyhow::Result<ModelSignal> {
        let score = features.sentiment();
        let band = self.params.neutral_band;

        let signal = if score.abs() < band {
            ModelSignal::new(&self.id, Action::Flat, (band - score.abs()) / band)
        } else {
            let action = if score > 0.0 { Action::Long } else { Action::Short };
            ModelSignal::new(&self.id, action, score.abs() * self.params.scale)
        };
        Ok(signal)
    }
}

/// Volatility / trend regime detector. Stays out of high-volatility markets.
pub struct RegimeModel {
    id: String,
    params: RegimeParams,
}

impl RegimeModel {
    pub fn new(id: impl Into<String>, params: RegimeParams) -> Result<Self, String> {
        if params.high_volatility <= 0.0 || params.trend_threshold <= 0.0 {
            return Err("regime thresholds must be positive".to_string());
        }
        Ok(Self {
            id: id.into(),
            params,
        })
    }
}

#[async_trait]
impl PredictiveModel for RegimeModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn predict(&self, features: &FeatureVector) -> anyhow::Result<ModelSignal> {
        let volatility = features.volatility();
        let gap20 = features.get("sma20_gap").unwrap_or(0.0);
        let gap50 = features.get("sma50_gap").unwrap_or(0.0);
        let threshold = self.params.trend_threshold;

        if volatility >= self.params.high_volatility {
            let confidence = 0.5 + 0.5 * (volatility / self.params.high_volatility - 1.0).min(1.0);
            return Ok(ModelSignal::new(&self.id, Action::Flat, confidence));
        }

        let strength = ((gap20.abs() + gap50.abs()) / (4.0 * threshold)).min(1.0);
        let signal = if gap20 > threshold && gap50 > threshold {
            ModelSignal::new(&self.id, Action::Long, strength)
        } else if gap20 < -threshold && gap50 < -threshold {
            ModelSignal::new(&self.id, Action::Short, strength)
        } else {
            ModelSignal::new(&self.id, Action::Flat, 0.5)
        };
        Ok(signal)
    }
}

pub fn load_artifact(path: &str) -> Result<ModelArtifact, ConfigError> {
    if !Path::new(path).exists() {
        return Err(ConfigError::ArtifactMissing(path.to_string()));
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ArtifactMalformed {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ArtifactMalformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Builds one slot per configured model, in configuration order.
pub fn load_models(configs: &[ModelConfig]) -> Result<Vec<ModelSlot>, ConfigError> {
    configs.iter().map(load_model).collect()
}

fn load_model(config: &ModelConfig) -> Result<ModelSlot, ConfigError> {
    let artifact = match &config.artifact {
        Some(path) => {
            let artifact = load_artifact(path)?;
            if artifact.kind() != config.kind {
                return Err(ConfigError::ArtifactMalformed {
                    path: path.clone(),
                    reason: format!(
                        "artifact is {:?} but model '{}' is configured as {:?}",
                        artifact.kind(),
                        config.id,
                        config.kind
                    ),
                });
            }
            artifact
        }
        None => match config.kind {
            ModelKind::PolicyGradient => ModelArtifact::PolicyGradient(PolicyParams::default()),
            ModelKind::Sentiment => ModelArtifact::Sentiment(SentimentParams::default()),
            ModelKind::Regime => ModelArtifact::Regime(RegimeParams::default()),
        },
    };

    let id = config.id.clone();
    let model: Result<Arc<dyn PredictiveModel>, String> = match artifact {
        ModelArtifact::PolicyGradient(p) => {
            PolicyGradientModel::new(id, p).map(|m| Arc::new(m) as Arc<dyn PredictiveModel>)
        }
        ModelArtifact::Sentiment(p) => {
            SentimentModel::new(id, p).map(|m| Arc::new(m) as Arc<dyn PredictiveModel>)
        }
        ModelArtifact::Regime(p) => {
            RegimeModel::new(id, p).map(|m| Arc::new(m) as Arc<dyn PredictiveModel>)
        }
    };
    let model = model.map_err(|reason| ConfigError::ArtifactMalformed {
        path: config.artifact.clone().unwrap_or_else(|| "<built-in>".to_string()),
        reason,
    })?;

    tracing::info!(
        "🧠 Loaded model '{}' ({:?}) weight={} timeout={}ms",
        config.id,
        config.kind,
        config.weight,
        config.timeout_ms
    );

    Ok(ModelSlot::new(
        model,
        config.weight,
        Duration::from_millis(config.timeout_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(return_1: f64, gap20: f64, gap50: f64, volatility: f64, sentiment: f64) -> FeatureVector {
        FeatureVector::from_values(
            "BTCUSDT",
            vec![100.0, return_1, 0.01, gap20, gap50, 0.5, 0.0, volatility, 1.0, sentiment],
        )
    }

    #[tokio::test]
    async fn test_policy_follows_momentum() {
        let model = PolicyGradientModel::new("pg", PolicyParams::default()).unwrap();

        let up = model.predict(&features(0.03, 0.02, 0.01, 0.005, 0.0)).await.unwrap();
        assert_eq!(up.action, Action::Long);

        let down = model.predict(&features(-0.03, -0.02, -0.01, 0.005, 0.0)).await.unwrap();
        assert_eq!(down.action, Action::Short);
        assert!(down.confidence > 0.0 && down.confidence <= 1.0);
    }

    #[test]
    fn test_policy_rejects_bad_shape() {
        let params = PolicyParams {
            weights: vec![vec![0.0; 3]; 3],
            bias: vec![0.0; 3],
        };
        assert!(PolicyGradientModel::new("pg", params).is_err());
    }

    #[tokio::test]
    async fn test_sentiment_neutral_band() {
        let model = SentimentModel::new("s", SentimentParams::default()).unwrap();

        let neutral = model.predict(&features(0.0, 0.0, 0.0, 0.01, 0.05)).await.unwrap();
        assert_eq!(neutral.action, Action::Flat);

        let bearish = model.predict(&features(0.0, 0.0, 0.0, 0.01, -0.6)).await.unwrap();
        assert_eq!(bearish.action, Action::Short);
        assert!((bearish.confidence - 0.72).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_regime_flat_in_high_volatility() {
        let model = RegimeModel::new("r", RegimeParams::default()).unwrap();

        let wild = model.predict(&features(0.0, 0.05, 0.05, 0.08, 0.0)).await.unwrap();
        assert_eq!(wild.action, Action::Flat);

        let trending = model.predict(&features(0.0, 0.01, 0.01, 0.01, 0.0)).await.unwrap();
        assert_eq!(trending.action, Action::Long);
        assert_eq!(trending.confidence, 1.0);
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let config = ModelConfig {
            id: "pg".to_string(),
            kind: ModelKind::PolicyGradient,
            artifact: Some("/nonexistent/policy.json".to_string()),
            weight: 1.0,
            timeout_ms: 100,
        };
        assert!(matches!(
            load_models(&[config]),
            Err(ConfigError::ArtifactMissing(_))
        ));
    }

    #[test]
    fn test_artifact_kind_mismatch_rejected() {
        let dir = std::env::temp_dir().join(format!("artifact-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("regime.json");
        let artifact = ModelArtifact::Regime(RegimeParams::default());
        std::fs::write(&path, serde_json::to_string(&artifact).unwrap()).unwrap();

        let config = ModelConfig {
            id: "pg".to_string(),
            kind: ModelKind::PolicyGradient,
            artifact: Some(path.to_string_lossy().to_string()),
            weight: 1.0,
            timeout_ms: 100,
        };
        assert!(matches!(
            load_models(&[config]),
            Err(ConfigError::ArtifactMalformed { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_built_in_models_load_in_order() {
        let slots = load_models(&crate::core::config::EnsembleConfig::default().models).unwrap();
        let ids: Vec<&str> = slots.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["policy_gradient", "sentiment", "regime"]);
    }
}
