use crate::Error;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Immutable snapshot of the leader's terminal response.
///
/// The status code is part of the record: followers must see exactly the
/// status the leader produced, never a defaulted 200.
#[derive(Clone, Debug)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Terminal state of a flight, replayed verbatim to every follower.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The leader's handler chain emitted a response. Any status counts,
    /// including error statuses: a 404 is a result, not a failure.
    Response(CapturedResponse),
    /// The leader never produced a response: its handler failed, its task
    /// died, or the flight hit the registry deadline.
    Failed(Error),
}
