pub mod ai;
pub mod core;
pub mod execution;
pub mod monitoring;
pub mod portfolio;
pub mod strategy;
pub mod streaming;
pub mod trading;
