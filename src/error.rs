//! Error types for the FIRST core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirstError>;

/// Error kinds the core distinguishes, per the service's error handling design.
///
/// Engine errors (`EngineError`, `EngineSkip`) never cross the `EngineManager`
/// boundary as `FirstError` — they're logged and isolated there. Everything
/// else becomes an envelope failure at the RPC facade.
#[derive(Error, Debug)]
pub enum FirstError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FirstError {
    /// Short code describing this failure, useful for logging and tests.
    /// Never sent to clients — the wire envelope carries only `msg`.
    pub fn code(&self) -> &'static str {
        match self {
            FirstError::InputInvalid(_) => "INPUT_INVALID",
            FirstError::NotFound(_) => "NOT_FOUND",
            FirstError::Unauthorized => "UNAUTHORIZED",
            FirstError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            FirstError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            FirstError::Json(_) => "INPUT_INVALID",
        }
    }
}
