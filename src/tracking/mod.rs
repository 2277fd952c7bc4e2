pub mod accuracy;
pub mod metrics;

pub use accuracy::{AccuracyFilter, AccuracyTracker, PredictionRequest};
