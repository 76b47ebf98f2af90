use coflight::DEFAULT_TTL;
use core::time::Duration;
use http::Method;
use std::collections::HashSet;

/// Snapshot cap applied to request bodies before hashing.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Policy surface for the coalescing layer.
#[derive(Clone, Debug)]
pub struct CoalesceConfig {
    /// Methods eligible for coalescing. Defaults to idempotent reads (GET,
    /// HEAD). Mutating methods must opt in explicitly: collapsing two
    /// independent side-effecting operations into one execution is rarely
    /// what a caller wants.
    pub dedupe_methods: HashSet<Method>,
    /// Deadline for a leader to settle before followers are force-released
    /// with a retryable failure.
    pub ttl: Duration,
    /// Whether a body that cannot be canonicalized bypasses coalescing for
    /// that single request (true) or is rejected with 422 (false).
    pub fail_open_on_hash_error: bool,
    /// Bodies larger than this are never buffered for hashing; the request
    /// passes through uncoalesced.
    pub max_body_bytes: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            dedupe_methods: HashSet::from([Method::GET, Method::HEAD]),
            ttl: DEFAULT_TTL,
            fail_open_on_hash_error: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl CoalesceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set of methods eligible for coalescing.
    pub fn dedupe_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.dedupe_methods = methods.into_iter().collect();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn fail_open_on_hash_error(mut self, fail_open: bool) -> Self {
        self.fail_open_on_hash_error = fail_open;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}
