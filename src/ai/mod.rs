pub mod consensus;
pub mod ensemble;
pub mod model;
pub mod models;

pub use consensus::{fuse, FusionPolicy, Vote};
pub use ensemble::EnsembleOrchestrator;
pub use model::{ModelSlot, PredictiveModel};
pub use models::{load_models, ModelArtifact, PolicyGradientModel, RegimeModel, SentimentModel};
