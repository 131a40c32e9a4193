use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::strategy::{FeatureVector, ModelSignal};

/// A trained predictive model behind the ensemble.
///
/// Implementations that do heavy CPU work should move it off the async
/// executor themselves (`spawn_blocking`); the ensemble only bounds wall time.
#[async_trait]
pub trait PredictiveModel: Send + Sync {
    fn id(&self) -> &str;

    async fn predict(&self, features: &FeatureVector) -> anyhow::Result<ModelSignal>;
}

/// A model together with its vote weight and its evaluation deadline.
#[derive(Clone)]
pub struct ModelSlot {
    pub model: Arc<dyn PredictiveModel>,
    pub weight: f64,
    pub timeout: Duration,
}

impl ModelSlot {
    pub fn new(model: Arc<dyn PredictiveModel>, weight: f64, timeout: Duration) -> Self {
        Self {
            model,
            weight,
            timeout,
        }
    }

    pub fn id(&self) -> &str {
        self.model.id()
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot")
            .field("model", &self.model.id())
            .field("weight", &self.weight)
            .field("timeout", &self.timeout)
            .finish()
    }
}
