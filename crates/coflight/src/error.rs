//! Error types for the coalescing coordinator.
//!
//! The coordinator never fails a request on its own behalf: every variant
//! here is either a reason to skip coalescing for one request
//! (`Canonicalize`) or a failure to replay to followers (`FlightTimeout`,
//! `HandlerFailed`). Coordinator-internal faults such as a double
//! settlement are logged and swallowed, never surfaced through a request.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the coalescing coordinator.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request body has no canonical byte form (not valid JSON).
    /// Callers fail open: the request proceeds without coalescing.
    #[error("body cannot be canonicalized: {reason}")]
    Canonicalize { reason: String },

    /// The leader did not settle within the flight deadline. Retryable:
    /// followers receive this, the leader's own round trip is unaffected.
    #[error("flight timed out after {after_ms}ms")]
    FlightTimeout { after_ms: u64 },

    /// The leader's handler chain terminated with an error instead of a
    /// response.
    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },
}

impl Error {
    /// Whether a follower receiving this failure may safely retry the
    /// request. Only the synthetic deadline failure qualifies; a handler
    /// failure is the handler's real outcome.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Error::FlightTimeout { .. })
    }
}
