use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::consensus::{fuse, FusionPolicy, Vote};
use super::model::ModelSlot;
use crate::core::error::{ConfigError, FusionError};
use crate::monitoring::{EngineMetrics, EventBus, EventKind};
use crate::strategy::{Contribution, FeatureVector, FusedSignal, ModelSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Timeout,
    Error,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Timeout => "timeout",
            Outcome::Error => "error",
        }
    }
}

/// Queries every model concurrently and fuses the answers that arrive in time.
///
/// Vote weights start from the slots and can be replaced at runtime from
/// performance metrics; a tick reads them once before querying.
pub struct EnsembleOrchestrator {
    slots: Vec<ModelSlot>,
    weights: RwLock<Vec<f64>>,
    quorum: usize,
    policy: FusionPolicy,
    events: Arc<EventBus>,
    metrics: Option<EngineMetrics>,
}

impl EnsembleOrchestrator {
    pub fn new(
        slots: Vec<ModelSlot>,
        quorum: usize,
        policy: FusionPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        let weights = slots.iter().map(|slot| slot.weight).collect();
        Self {
            slots,
            weights: RwLock::new(weights),
            quorum,
            policy,
            events,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn model_count(&self) -> usize {
        self.slots.len()
    }

    /// Current vote weight of every model, in slot order.
    pub async fn weights(&self) -> Vec<(String, f64)> {
        let weights = self.weights.read().await;
        self.slots
            .iter()
            .zip(weights.iter())
            .map(|(slot, weight)| (slot.id().to_string(), *weight))
            .collect()
    }

    /// Replaces vote weights with `performance` normalized to sum to one.
    ///
    /// Models missing from `performance` get weight zero. Unknown ids, negative or
    /// non-finite metrics, and an all-zero total are rejected and leave the weights
    /// unchanged.
    pub async fn update_weights(&self, performance: &HashMap<String, f64>) -> Result<(), ConfigError> {
        for (model_id, metric) in performance {
            if !self.slots.iter().any(|slot| slot.id() == model_id) {
                return Err(ConfigError::Invalid(format!("unknown model '{}'", model_id)));
            }
            if !(metric.is_finite() && *metric >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "performance of '{}' must be finite and non-negative, got {}",
                    model_id, metric
                )));
            }
        }
        let total: f64 = performance.values().sum();
        if total <= 0.0 {
            return Err(ConfigError::Invalid("performance metrics sum to zero".to_string()));
        }

        let updated: Vec<f64> = self
            .slots
            .iter()
            .map(|slot| performance.get(slot.id()).copied().unwrap_or(0.0) / total)
            .collect();
        for (slot, weight) in self.slots.iter().zip(&updated) {
            tracing::info!("⚖️  Model '{}' weight {:.4}", slot.id(), weight);
        }
        *self.weights.write().await = updated;
        Ok(())
    }

    pub async fn evaluate(&self, features: &FeatureVector) -> FusedSignal {
        let shared = Arc::new(features.clone());
        let weights = self.weights.read().await.clone();

        // Each model runs on its own task so a blocking model cannot starve the rest.
        let calls = self.slots.iter().zip(weights).map(|(slot, weight)| {
            let slot = slot.clone();
            let features = shared.clone();
            async move {
                let started = Instant::now();
                let model = slot.model.clone();
                let mut handle =
                    tokio::spawn(async move { model.predict(&features).await });

                let outcome = match tokio::time::timeout(slot.timeout, &mut handle).await {
                    Ok(Ok(Ok(signal))) => Ok(signal),
                    Ok(Ok(Err(e))) => Err((Outcome::Error, e.to_string())),
                    Ok(Err(join_error)) => Err((Outcome::Error, join_error.to_string())),
                    Err(_) => {
                        handle.abort();
                        Err((Outcome::Timeout, format!("exceeded {:?}", slot.timeout)))
                    }
                };
                (slot, weight, started.elapsed(), outcome)
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut votes = Vec::with_capacity(results.len());
        let mut contributors = Vec::with_capacity(results.len());
        for (slot, weight, latency, outcome) in results {
            let model_id = slot.id().to_string();
            match outcome {
                Ok(signal) => {
                    let signal = ModelSignal::new(&model_id, signal.action, signal.confidence);
                    self.record(&model_id, Outcome::Ok, latency);
                    contributors.push(Contribution {
                        model_id,
                        weight,
                        action: signal.action,
                        confidence: signal.confidence,
                    });
                    votes.push(Vote {
                        weight,
                        signal,
                    });
                }
                Err((kind, reason)) => {
                    tracing::warn!(
                        "⏱️  Model '{}' excluded for {} ({}): {}",
                        model_id,
                        features.symbol,
                        kind.as_str(),
                        reason
                    );
                    self.record(&model_id, kind, latency);
                }
            }
        }

        let fused = if votes.len() < self.quorum {
            let error = FusionError {
                responded: votes.len(),
                configured: self.slots.len(),
                quorum: self.quorum,
            };
            tracing::warn!("⚠️  {} degraded to FLAT: {}", features.symbol, error);
            FusedSignal::degraded(&features.symbol, error, contributors)
        } else {
            let (action, confidence) = fuse(self.policy, &votes);
            FusedSignal {
                symbol: features.symbol.clone(),
                action,
                confidence,
                contributors,
                fusion_error: None,
            }
        };

        tracing::debug!(
            "🎯 {} fused {} (confidence {:.3}, {} models)",
            fused.symbol,
            fused.action,
            fused.confidence,
            fused.contributors.len()
        );
        self.events.emit(
            EventKind::SignalFused,
            json!({
                "symbol": fused.symbol,
                "action": fused.action,
                "confidence": fused.confidence,
                "contributors": fused.contributors,
                "fusion_error": fused.fusion_error.as_ref().map(|e| e.to_string()),
            }),
        );

        fused
    }

    fn record(&self, model_id: &str, outcome: Outcome, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_model(model_id, outcome.as_str(), latency);
        }
        self.events.emit(
            EventKind::ModelLatency,
            json!({
                "model": model_id,
                "outcome": outcome.as_str(),
                "latency_ms": latency.as_secs_f64() * 1000.0,
            }),
        );
    }
}
