use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SignalFused,
    ModelLatency,
    TickSkipped,
    RiskBlocked,
    DrawdownBreach,
    BreakerReset,
    OrderTransition,
    ExecutionFailure,
    FillApplied,
    PersistenceFailure,
    SymbolHalted,
}

/// Structured event handed to whatever delivers alerts and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Fatal events go to the operator alert channel.
    pub fn is_alert(&self) -> bool {
        matches!(
            self.kind,
            EventKind::DrawdownBreach
                | EventKind::ExecutionFailure
                | EventKind::PersistenceFailure
                | EventKind::SymbolHalted
        )
    }
}

pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        if event.is_alert() {
            tracing::warn!("🚨 {:?}: {}", event.kind, event.payload);
        }
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!("📡 Event published to {} receivers", receivers);
            }
            Err(_) => {
                // Nobody listening; monitoring is optional.
            }
        }
    }

    pub fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.publish(DomainEvent::new(kind, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}
