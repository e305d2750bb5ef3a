//! Error taxonomy for the session-control core.
//!
//! Only [`ConfigurationError`] and [`EvaluationError`] ever reach a caller.
//! Judgment parse failures and notification failures are recovered where they
//! happen and exist as types so they can be logged with structure.

use std::time::Duration;

/// Required participant metadata is missing or invalid.
///
/// Fatal for the connection attempt that produced it. It is never retried,
/// because the same metadata would fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("participant metadata is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigurationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// The evaluator was asked to judge usage without knowing which meaning is tested.
    #[error(
        "a target definition is required to evaluate usage of '{phrase}'; check metadata passing from the client"
    )]
    MissingDefinition { phrase: String },
}

/// The judgment capability answered with something that is not a verdict.
#[derive(Debug, thiserror::Error)]
#[error("judgment output is not a valid verdict: {source}")]
pub struct JudgmentParseError {
    #[from]
    source: serde_json::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("RPC '{method}' to '{destination}' timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        destination: String,
        timeout: Duration,
    },
    #[error("RPC '{method}' to '{destination}' failed: {source}")]
    Delivery {
        method: &'static str,
        destination: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to encode '{method}' payload: {source}")]
    Encode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
