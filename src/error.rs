//! Error taxonomy for the ingestion pipeline.
//!
//! Errors are classified by kind, not by origin type: the kind decides the
//! recovery policy (retry with backoff, resync, drop-and-count, fail the
//! call, abort the task). Application seams that don't branch on the kind
//! use `anyhow` as usual.

use thiserror::Error;

/// Pipeline error classified by recovery policy.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Stream disconnects, stalls, handshake failures. Recovered locally by
    /// the session state machine with backoff.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed or out-of-contract venue data: depth chain breaks, missing
    /// fields, out-of-range values. Depth chain breaks trigger a resync;
    /// single-event violations are dropped and counted.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Store connectivity loss, constraint violation, timeout. Retried with
    /// backoff by the batch writer; constraint violations are bisected.
    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),

    /// Data-quality finding surfaced by the validator. Never blocks
    /// ingestion.
    #[error("validation: {0}")]
    Validation(String),

    /// Invalid options at Start. Fails the call synchronously; prior state
    /// is preserved.
    #[error("config: {0}")]
    Config(String),

    /// Invariant violation in our own code. The offending task aborts and
    /// is restarted by the supervisor.
    #[error("internal: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether local retry with backoff is the right recovery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transport(_) | IngestError::Store(_))
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        IngestError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        IngestError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        IngestError::Internal(msg.into())
    }
}

/// Whether a store error is a constraint violation (poison row candidate)
/// rather than a transient failure.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(IngestError::transport("reset").is_retryable());
        assert!(!IngestError::protocol("gap").is_retryable());
        assert!(!IngestError::config("bad channel").is_retryable());
    }
}
