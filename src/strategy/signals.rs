use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::FusionError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Long,
    Short,
    Flat,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Long => write!(f, "LONG"),
            Action::Short => write!(f, "SHORT"),
            Action::Flat => write!(f, "FLAT"),
        }
    }
}

/// One model's opinion for one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSignal {
    pub model_id: String,
    pub action: Action,
    pub confidence: f64,
}

impl ModelSignal {
    /// Confidence is clamped into `[0, 1]`; NaN counts as no confidence.
    pub fn new(model_id: impl Into<String>, action: Action, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            model_id: model_id.into(),
            action,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    pub model_id: String,
    pub weight: f64,
    pub action: Action,
    pub confidence: f64,
}

/// The ensemble's single decision for one symbol at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedSignal {
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    /// Only models that answered within their deadline.
    pub contributors: Vec<Contribution>,
    pub fusion_error: Option<FusionError>,
}

impl FusedSignal {
    pub fn degraded(symbol: impl Into<String>, error: FusionError, contributors: Vec<Contribution>) -> Self {
        Self {
            symbol: symbol.into(),
            action: Action::Flat,
            confidence: 0.0,
            contributors,
            fusion_error: Some(error),
        }
    }

    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            action: Action::Flat,
            confidence: 0.0,
            contributors: Vec::new(),
            fusion_error: None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action != Action::Flat && self.fusion_error.is_none()
    }
}
