pub mod features;
pub mod indicators;
pub mod signals;

pub use features::{FeatureBuilder, FeatureVector, MarketSnapshot, FEATURE_NAMES};
pub use signals::{Action, Contribution, FusedSignal, ModelSignal};
