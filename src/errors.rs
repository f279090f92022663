use std::time::Duration;
use thiserror::Error;

use crate::admission::RateKey;

/// Failures surfaced by intake steps, the admission gate and the saga itself.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Network or 5xx-class failure; retried per the step's policy.
    #[error("transient failure in {operation}: {reason}")]
    TransientRemoteFailure { operation: String, reason: String },

    /// No admission token arrived before the caller's deadline.
    #[error("no admission token on '{key}' within {waited:?}")]
    AdmissionTimeout { key: RateKey, waited: Duration },

    /// Retry budget exhausted or a non-retryable response.
    #[error("step '{step}' failed after {attempts} attempt(s): {reason}")]
    UnrecoverableRemoteFailure {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// One file pipeline in the conversion fan-out could not complete.
    #[error("conversion of '{file}' failed: {source}")]
    FanoutMemberFailure {
        file: String,
        #[source]
        source: Box<IntakeError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("state invariant violated: {0}")]
    Invariant(String),

    #[error("admission channel error: {0}")]
    Channel(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IntakeError {
    pub fn transient(operation: &str, reason: impl std::fmt::Display) -> Self {
        IntakeError::TransientRemoteFailure {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// A non-retryable failure observed on the first attempt of `step`.
    pub fn rejected(step: &str, reason: impl std::fmt::Display) -> Self {
        IntakeError::UnrecoverableRemoteFailure {
            step: step.to_string(),
            attempts: 1,
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntakeError::TransientRemoteFailure { .. } | IntakeError::AdmissionTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(err: serde_json::Error) -> Self {
        IntakeError::Checkpoint(err.to_string())
    }
}

impl From<std::io::Error> for IntakeError {
    fn from(err: std::io::Error) -> Self {
        IntakeError::Checkpoint(err.to_string())
    }
}
