use thiserror::Error;

/// Errors raised by the correlation engine and accuracy tracker.
///
/// Data-quality problems (`InsufficientData`, `TransferUnavailable`,
/// `Timeout`) are recovered inside the engine and only show up as a degraded
/// `calculation_method`. `StoreUnavailable` and the tracker lifecycle errors
/// reach the caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("insufficient data: {actual} samples, {required} required")]
    InsufficientData { required: usize, actual: usize },

    #[error("no eligible transfer source for {factor_a} ~ {factor_b} in {domain}")]
    TransferUnavailable {
        factor_a: String,
        factor_b: String,
        domain: String,
    },

    #[error("matrix validation failed: {0}")]
    MatrixValidation(String),

    #[error("prediction not found: {0}")]
    NotFound(String),

    #[error("prediction already resolved: {0}")]
    AlreadyResolved(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl EngineError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_) | EngineError::Timeout(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
