//! Pipeline error taxonomy.
//!
//! Every failure the pipeline can surface is one of these variants; the
//! retry policy, metrics labels and exit codes all key off
//! [`PipelineError::code`]. Matching is structural, never on message text,
//! so wrapping a message string does not change classification.

use std::io;

use strum::AsRefStr;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cancellation or deadline observed; never retried.
    #[error("cancelled")]
    Cancelled,

    /// Token budget or quota exhausted (local budget arithmetic or an
    /// upstream 429).
    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("rate limited by provider")]
    RateLimited,

    /// The LLM response violates the structured-output protocol.
    #[error("response invalid: {0}")]
    ResponseInvalid(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Span ordering/overlap invariants violated during assembly.
    #[error("sequence invalid: {0}")]
    SequenceInvalid(String),

    /// Artifact id maps to an invalid or escaping filesystem path.
    #[error("path invalid: {0}")]
    PathInvalid(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Upstream HTTP failure carrying the status for diagnostics. Only
    /// constructed for retryable statuses (5xx and 408); other statuses map
    /// to `InvalidInput` at the client.
    #[error("upstream {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Transport-level network failure (connect, timeout, broken stream).
    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

/// Minimal classification code shared by the retry table, metrics counters
/// and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorCode {
    Cancel,
    Budget,
    Protocol,
    Invariant,
    Io,
    Network,
    Unknown,
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cancelled => ErrorCode::Cancel,
            Self::BudgetExceeded(_) | Self::RateLimited => ErrorCode::Budget,
            Self::ResponseInvalid(_) => ErrorCode::Protocol,
            Self::InvalidInput(_)
            | Self::SequenceInvalid(_)
            | Self::PathInvalid(_)
            | Self::Invariant(_) => ErrorCode::Invariant,
            Self::Io(_) => ErrorCode::Io,
            Self::Upstream { .. } | Self::Network(_) => ErrorCode::Network,
            Self::Other(_) => ErrorCode::Unknown,
        }
    }

    /// Whether a failed LLM invocation may be retried: rate limits and
    /// budget pressure clear as the gate refills, network faults are
    /// transient. Everything else fails the batch.
    pub fn retry_invoke(&self) -> bool {
        matches!(self.code(), ErrorCode::Budget | ErrorCode::Network)
    }

    /// Whether a failed decode may be retried: only protocol violations
    /// (the model may produce valid output on another attempt).
    pub fn retry_decode(&self) -> bool {
        self.code() == ErrorCode::Protocol
    }

    pub fn budget(msg: impl Into<String>) -> Self {
        Self::BudgetExceeded(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ResponseInvalid(msg.into())
    }

    /// Error to propagate through an artifact byte pipe when a run aborts.
    /// Cancellation keeps its identity; everything else is carried as an
    /// opaque abort so the original (non-clonable) error can still be
    /// returned from the dispatcher.
    pub fn stream_abort(&self) -> Self {
        match self.code() {
            ErrorCode::Cancel => Self::Cancelled,
            _ => Self::Other(format!("aborted: {self}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err() -> PipelineError {
        PipelineError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
    }

    #[test]
    fn every_variant_classifies() {
        let cases: Vec<(PipelineError, ErrorCode)> = vec![
            (PipelineError::Cancelled, ErrorCode::Cancel),
            (PipelineError::budget("b"), ErrorCode::Budget),
            (PipelineError::RateLimited, ErrorCode::Budget),
            (PipelineError::protocol("p"), ErrorCode::Protocol),
            (PipelineError::invalid("i"), ErrorCode::Invariant),
            (PipelineError::SequenceInvalid("s".into()), ErrorCode::Invariant),
            (PipelineError::PathInvalid("p".into()), ErrorCode::Invariant),
            (PipelineError::Invariant("v".into()), ErrorCode::Invariant),
            (io_err(), ErrorCode::Io),
            (
                PipelineError::Upstream { status: 503, message: "u".into() },
                ErrorCode::Network,
            ),
            (PipelineError::Network("n".into()), ErrorCode::Network),
            (PipelineError::Other("o".into()), ErrorCode::Unknown),
        ];
        for (err, want) in cases {
            assert_eq!(err.code(), want, "wrong code for {err:?}");
        }
    }

    #[test]
    fn invoke_retries_budget_and_network_only() {
        assert!(PipelineError::RateLimited.retry_invoke());
        assert!(PipelineError::budget("b").retry_invoke());
        assert!(PipelineError::Network("n".into()).retry_invoke());
        assert!(PipelineError::Upstream { status: 500, message: String::new() }.retry_invoke());
        assert!(!PipelineError::Cancelled.retry_invoke());
        assert!(!PipelineError::protocol("p").retry_invoke());
        assert!(!PipelineError::invalid("i").retry_invoke());
        assert!(!io_err().retry_invoke());
        assert!(!PipelineError::Other("o".into()).retry_invoke());
    }

    #[test]
    fn decode_retries_protocol_only() {
        assert!(PipelineError::protocol("p").retry_decode());
        assert!(!PipelineError::Cancelled.retry_decode());
        assert!(!PipelineError::RateLimited.retry_decode());
        assert!(!PipelineError::invalid("i").retry_decode());
    }

    #[test]
    fn stream_abort_preserves_cancellation() {
        assert_eq!(PipelineError::Cancelled.stream_abort().code(), ErrorCode::Cancel);
        assert_eq!(io_err().stream_abort().code(), ErrorCode::Unknown);
    }

    #[test]
    fn code_labels_are_lowercase() {
        assert_eq!(ErrorCode::Cancel.as_ref(), "cancel");
        assert_eq!(ErrorCode::Network.as_ref(), "network");
        assert_eq!(ErrorCode::Unknown.as_ref(), "unknown");
    }
}
