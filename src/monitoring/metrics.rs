use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Prometheus counters for the decision core, served on `/metrics`.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    model_latency: HistogramVec,
    model_outcomes: IntCounterVec,
    ticks_skipped: IntCounterVec,
    risk_blocks: IntCounterVec,
    order_transitions: IntCounterVec,
    fills_applied: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let model_latency = HistogramVec::new(
            HistogramOpts::new("model_latency_seconds", "Model inference latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["model"],
        )?;
        let model_outcomes = IntCounterVec::new(
            Opts::new("model_outcomes_total", "Model responses by outcome"),
            &["model", "outcome"],
        )?;
        let ticks_skipped = IntCounterVec::new(
            Opts::new("ticks_skipped_total", "Ticks dropped before risk evaluation"),
            &["reason"],
        )?;
        let risk_blocks = IntCounterVec::new(
            Opts::new("risk_blocks_total", "Risk manager blocks by reason"),
            &["reason"],
        )?;
        let order_transitions = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order status transitions"),
            &["status"],
        )?;
        let fills_applied = IntCounter::new("fills_applied_total", "Fills applied to the ledger")?;

        registry.register(Box::new(model_latency.clone()))?;
        registry.register(Box::new(model_outcomes.clone()))?;
        registry.register(Box::new(ticks_skipped.clone()))?;
        registry.register(Box::new(risk_blocks.clone()))?;
        registry.register(Box::new(order_transitions.clone()))?;
        registry.register(Box::new(fills_applied.clone()))?;

        Ok(Self {
            registry,
            model_latency,
            model_outcomes,
            ticks_skipped,
            risk_blocks,
            order_transitions,
            fills_applied,
        })
    }

    pub fn record_model(&self, model: &str, outcome: &str, latency: Duration) {
        self.model_latency
            .with_label_values(&[model])
            .observe(latency.as_secs_f64());
        self.model_outcomes
            .with_label_values(&[model, outcome])
            .inc();
    }

    pub fn record_skip(&self, reason: &str) {
        self.ticks_skipped.with_label_values(&[reason]).inc();
    }

    pub fn record_block(&self, reason: &str) {
        self.risk_blocks.with_label_values(&[reason]).inc();
    }

    pub fn record_transition(&self, status: &str) {
        self.order_transitions.with_label_values(&[status]).inc();
    }

    pub fn record_fill(&self) {
        self.fills_applied.inc();
    }

    pub fn model_outcome_count(&self, model: &str, outcome: &str) -> u64 {
        self.model_outcomes
            .with_label_values(&[model, outcome])
            .get()
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_outcomes_counted() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_model("sentiment", "ok", Duration::from_millis(12));
        metrics.record_model("sentiment", "ok", Duration::from_millis(8));
        metrics.record_model("sentiment", "timeout", Duration::from_millis(250));

        assert_eq!(metrics.model_outcome_count("sentiment", "ok"), 2);
        assert_eq!(metrics.model_outcome_count("sentiment", "timeout"), 1);
    }

    #[test]
    fn test_render_contains_registered_series() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_block("max_open_trades");
        metrics.record_fill();

        let text = metrics.render();
        assert!(text.contains("risk_blocks_total"));
        assert!(text.contains("fills_applied_total 1"));
    }
}
