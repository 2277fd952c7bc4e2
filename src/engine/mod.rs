pub mod correlation;
pub mod joint;
pub mod optimizer;
pub mod stats;
pub mod transfer;

pub use correlation::{CorrelationEngine, FactorPrediction, JointProbability, MatrixOptions};
pub use transfer::{TransferLearningAdapter, TransferOutcome};
