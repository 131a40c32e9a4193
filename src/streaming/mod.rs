pub mod replay;

pub use replay::ReplayFeed;
