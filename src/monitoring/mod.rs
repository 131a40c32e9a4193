pub mod event_bus;
pub mod metrics;

pub use event_bus::{DomainEvent, EventBus, EventKind};
pub use metrics::EngineMetrics;
