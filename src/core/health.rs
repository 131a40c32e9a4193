use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
    pub halted_symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub snapshot_store: bool,
    pub exchange: bool,
    pub models: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, bool>,
}

impl ComponentHealth {
    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "snapshot_store" => Some(self.snapshot_store),
            "exchange" => Some(self.exchange),
            "models" => Some(self.models),
            _ => self.extra.get(key).copied(),
        }
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    status: Arc<RwLock<ComponentHealth>>,
    halted: Arc<RwLock<Vec<String>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            status: Arc::new(RwLock::new(ComponentHealth {
                snapshot_store: false,
                exchange: false,
                models: false,
                extra: HashMap::new(),
            })),
            halted: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();
        let halted_symbols = self.halted.read().await.clone();

        let healthy = components.snapshot_store
            && components.exchange
            && components.models
            && halted_symbols.is_empty();

        HealthStatus {
            status: if healthy {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
            halted_symbols,
        }
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut status = self.status.write().await;
        match component {
            "snapshot_store" => status.snapshot_store = healthy,
            "exchange" => status.exchange = healthy,
            "models" => status.models = healthy,
            _ => {
                status.extra.insert(component.to_string(), healthy);
            }
        }
    }

    pub async fn mark_halted(&self, symbol: &str) {
        let mut halted = self.halted.write().await;
        if !halted.iter().any(|s| s == symbol) {
            halted.push(symbol.to_string());
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_degraded_until_components_report() {
        let checker = HealthChecker::new();
        assert_eq!(checker.get_status().await.status, "degraded");

        checker.update_component("snapshot_store", true).await;
        checker.update_component("exchange", true).await;
        checker.update_component("models", true).await;
        assert_eq!(checker.get_status().await.status, "healthy");

        checker.mark_halted("ETHUSDT").await;
        checker.mark_halted("ETHUSDT").await;
        let status = checker.get_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.halted_symbols, vec!["ETHUSDT".to_string()]);
    }
}
