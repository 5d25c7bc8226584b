//! Error kinds surfaced by the orchestration core.
//!
//! Every fallible public operation returns [`OrchestrationError`]. Kinds map
//! 1:1 onto the recovery policy described in the design: `Dependency` is
//! retried and counted against a circuit breaker, `Cancelled` is an expected
//! outcome rather than a failure, everything else surfaces to the caller.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
