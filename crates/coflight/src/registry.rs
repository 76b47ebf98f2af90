//! Flight registry: leader election, settlement fan-out, and guaranteed
//! teardown for coalesced requests.
//!
//! The registry owns the only shared mutable state in the crate, a map from
//! [`Fingerprint`] to the one live flight for that fingerprint. Everything
//! else interacts with it exclusively through [`Registry::begin`] and the
//! tokens it hands out: a [`LeaderToken`] carrying the settle-exactly-once
//! capability, or a [`FollowerHandle`] that resolves with the leader's
//! outcome.
//!
//! Teardown is funneled through a single idempotent path reached from every
//! exit: the leader settling, the leader's token being dropped unsettled,
//! and the per-flight deadline reaper.

use crate::{Error, Fingerprint, Outcome};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Deadline applied to a flight when none is configured explicitly.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// One in-flight coalesced request.
///
/// At most one of these exists per fingerprint at any instant. It is
/// created when a leader is elected, mutated only to attach followers, and
/// torn down exactly once by [`settle_flight`].
struct Flight {
    fingerprint: Fingerprint,
    created_at: Instant,
    /// Followers currently waiting. Attach increments, [`FollowerHandle`]
    /// drop decrements, so this tracks live interest only.
    followers: AtomicUsize,
    /// Settlement latch. Whoever swaps this false -> true performs the
    /// teardown; every later outcome for the flight is dropped.
    settled: AtomicBool,
    outcome: watch::Sender<Option<Outcome>>,
    /// Cancelled on settlement so the deadline reaper exits early.
    deadline: CancellationToken,
}

struct Shared {
    flights: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
}

/// Concurrency-safe fingerprint -> flight map with leader/follower
/// arbitration.
///
/// The registry is process-local: flights vanish on restart, and a flight
/// that has settled leaves no trace, so a later request for the same
/// fingerprint always starts fresh.
pub struct Registry {
    shared: Arc<Shared>,
    ttl: Duration,
}

/// Result of [`Registry::begin`]: either this request runs the handler
/// chain, or it waits for the one that already is.
pub enum Entry {
    Leader(LeaderToken),
    Follower(FollowerHandle),
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                flights: Mutex::new(HashMap::new()),
            }),
            ttl,
        }
    }

    /// Elects this request leader for `fingerprint`, or attaches it as a
    /// follower of the flight already in progress.
    ///
    /// The check-and-insert runs under one lock acquisition with no await
    /// point, so two concurrent callers can never both be elected for the
    /// same fingerprint.
    ///
    /// Must be called from within a tokio runtime: electing a leader spawns
    /// the flight's deadline reaper.
    pub fn begin(&self, fingerprint: Fingerprint) -> Entry {
        let mut flights = self.shared.flights.lock();
        match flights.entry(fingerprint) {
            MapEntry::Occupied(slot) => {
                let flight = Arc::clone(slot.get());
                drop(flights);
                flight.followers.fetch_add(1, Ordering::Relaxed);
                let rx = flight.outcome.subscribe();
                #[cfg(feature = "tracing")]
                tracing::debug!(flight = %fingerprint, "attached follower");
                Entry::Follower(FollowerHandle { flight, rx })
            }
            MapEntry::Vacant(slot) => {
                let flight = Arc::new(Flight {
                    fingerprint,
                    created_at: Instant::now(),
                    followers: AtomicUsize::new(0),
                    settled: AtomicBool::new(false),
                    outcome: watch::channel(None).0,
                    deadline: CancellationToken::new(),
                });
                slot.insert(Arc::clone(&flight));
                drop(flights);
                self.spawn_reaper(Arc::clone(&flight));
                #[cfg(feature = "tracing")]
                tracing::debug!(flight = %fingerprint, "elected leader");
                Entry::Leader(LeaderToken {
                    shared: Arc::clone(&self.shared),
                    flight,
                })
            }
        }
    }

    /// Number of live flights.
    pub fn inflight(&self) -> usize {
        self.shared.flights.lock().len()
    }

    /// Live followers attached to the flight for `fingerprint`, or zero if
    /// no such flight exists.
    pub fn followers(&self, fingerprint: &Fingerprint) -> usize {
        self.shared
            .flights
            .lock()
            .get(fingerprint)
            .map(|flight| flight.followers.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Spawns the safety net for a fresh flight: if nothing settles it
    /// within `ttl`, the reaper force-settles a retryable timeout so
    /// followers are never left waiting on a leader whose connection died.
    fn spawn_reaper(&self, flight: Arc<Flight>) {
        let shared = Arc::clone(&self.shared);
        let ttl = self.ttl;
        tokio::spawn(async move {
            let deadline = flight.deadline.clone();
            tokio::select! {
                () = deadline.cancelled() => {}
                () = tokio::time::sleep(ttl) => {
                    let _forced = settle_flight(
                        &shared,
                        &flight,
                        Outcome::Failed(Error::FlightTimeout {
                            after_ms: ttl.as_millis() as u64,
                        }),
                    );
                    #[cfg(feature = "tracing")]
                    {
                        if _forced {
                            tracing::warn!(
                                flight = %flight.fingerprint,
                                waited_ms = flight.created_at.elapsed().as_millis() as u64,
                                "flight hit deadline before the leader settled; followers released",
                            );
                        }
                    }
                }
            }
        });
    }
}

/// Settles a flight exactly once: cancels its reaper, removes it from the
/// registry, and broadcasts the outcome to every attached follower.
///
/// Returns false (dropping `outcome`) if the flight had already settled.
///
/// Removal precedes the broadcast. A follower can only attach while the
/// flight is in the map, so everything attached by broadcast time observes
/// the outcome, and a request arriving after removal starts a fresh flight
/// instead of coalescing with a finished one.
fn settle_flight(shared: &Shared, flight: &Arc<Flight>, outcome: Outcome) -> bool {
    if flight.settled.swap(true, Ordering::AcqRel) {
        return false;
    }
    flight.deadline.cancel();
    {
        let mut flights = shared.flights.lock();
        let is_current = flights
            .get(&flight.fingerprint)
            .is_some_and(|current| Arc::ptr_eq(current, flight));
        if is_current {
            flights.remove(&flight.fingerprint);
        }
    }
    flight.outcome.send_replace(Some(outcome));
    true
}

/// Capability to settle a flight, held by the one request that runs the
/// handler chain.
///
/// Dropping the token without calling [`settle`](Self::settle) counts as a
/// failed flight: followers are released with [`Error::HandlerFailed`]
/// rather than waiting out the deadline.
pub struct LeaderToken {
    shared: Arc<Shared>,
    flight: Arc<Flight>,
}

impl LeaderToken {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.flight.fingerprint
    }

    /// Time since the flight was created.
    pub fn age(&self) -> Duration {
        self.flight.created_at.elapsed()
    }

    /// Followers currently attached.
    pub fn followers(&self) -> usize {
        self.flight.followers.load(Ordering::Relaxed)
    }

    /// Records the flight's one terminal outcome and releases all
    /// followers.
    ///
    /// Settling twice is a programming error; the second outcome is logged
    /// and dropped, never double-delivered. Losing the race against the
    /// deadline reaper looks the same: whichever side settles first wins.
    pub fn settle(self, outcome: Outcome) {
        let _fresh = settle_flight(&self.shared, &self.flight, outcome);
        #[cfg(feature = "tracing")]
        {
            if !_fresh {
                tracing::warn!(
                    flight = %self.flight.fingerprint,
                    "flight settled twice; second outcome dropped",
                );
            }
        }
    }
}

impl Drop for LeaderToken {
    fn drop(&mut self) {
        // Reached unsettled only when the leader's task died (panic or
        // cancellation) before emitting a terminal result. `settle` marks
        // the flight settled before the token drops, so the normal path
        // ends up a no-op here.
        if !self.flight.settled.load(Ordering::Acquire) {
            settle_flight(
                &self.shared,
                &self.flight,
                Outcome::Failed(Error::HandlerFailed {
                    reason: "leader dropped before settling".to_string(),
                }),
            );
        }
    }
}

/// A waiter attached to an in-flight request.
///
/// Dropping the handle before settlement withdraws this one waiter; the
/// leader and the remaining followers are unaffected.
pub struct FollowerHandle {
    flight: Arc<Flight>,
    rx: watch::Receiver<Option<Outcome>>,
}

impl FollowerHandle {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.flight.fingerprint
    }

    /// Resolves once the flight settles.
    ///
    /// Never hangs indefinitely: settlement is guaranteed by the leader,
    /// its drop guard, or the deadline reaper. `wait_for` inspects the
    /// current value before parking, so an outcome published between
    /// attachment and the first poll is still observed.
    pub async fn outcome(mut self) -> Outcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(settled) => match settled.as_ref() {
                Some(outcome) => outcome.clone(),
                // wait_for only returns on Some
                None => Outcome::Failed(Error::HandlerFailed {
                    reason: "flight settled without an outcome".to_string(),
                }),
            },
            // The flight's sender lives as long as this handle, so this arm
            // is unreachable in practice; fail rather than fabricate.
            Err(_) => Outcome::Failed(Error::HandlerFailed {
                reason: "flight dropped before settling".to_string(),
            }),
        }
    }
}

impl Drop for FollowerHandle {
    fn drop(&mut self) {
        self.flight.followers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CapturedResponse;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Barrier;

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::derive("GET", path, b"").expect("static fingerprint")
    }

    fn captured(status: u16, body: &'static str) -> Outcome {
        Outcome::Response(CapturedResponse {
            status: StatusCode::from_u16(status).expect("valid status"),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    fn lead(registry: &Registry, fingerprint: Fingerprint) -> LeaderToken {
        match registry.begin(fingerprint) {
            Entry::Leader(token) => token,
            Entry::Follower(_) => panic!("expected to lead"),
        }
    }

    fn follow(registry: &Registry, fingerprint: Fingerprint) -> FollowerHandle {
        match registry.begin(fingerprint) {
            Entry::Leader(_) => panic!("expected to follow"),
            Entry::Follower(handle) => handle,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn elects_exactly_one_leader_under_contention() {
        const WAITERS: usize = 32;
        let registry = Arc::new(Registry::new(DEFAULT_TTL));
        let barrier = Arc::new(Barrier::new(WAITERS));
        let leaders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::with_capacity(WAITERS);
        for _ in 0..WAITERS {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let leaders = Arc::clone(&leaders);
            tasks.push(tokio::spawn(async move {
                let entry = registry.begin(fp("/packages/track/PKG12345678"));
                // Hold the entry until everyone has begun, so no settlement
                // can race ahead of the last election attempt.
                barrier.wait().await;
                match entry {
                    Entry::Leader(token) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        token.settle(captured(200, "tracked"));
                        None
                    }
                    Entry::Follower(handle) => Some(handle.outcome().await),
                }
            }));
        }

        for task in tasks {
            match task.await.expect("task panicked") {
                None => {}
                Some(Outcome::Response(resp)) => {
                    assert_eq!(resp.status, StatusCode::OK);
                    assert_eq!(resp.body, Bytes::from_static(b"tracked"));
                }
                Some(other) => panic!("follower saw {other:?}"),
            }
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test]
    async fn follower_replays_status_and_body() {
        let registry = Registry::new(DEFAULT_TTL);
        let fingerprint = fp("/packages/track/MISSING");
        let leader = lead(&registry, fingerprint);
        let follower = follow(&registry, fingerprint);
        assert_eq!(registry.followers(&fingerprint), 1);
        assert!(leader.age() < DEFAULT_TTL);

        leader.settle(captured(404, r#"{"success":false}"#));

        match follower.outcome().await {
            Outcome::Response(resp) => {
                assert_eq!(resp.status, StatusCode::NOT_FOUND);
                assert_eq!(resp.body, Bytes::from_static(br#"{"success":false}"#));
            }
            other => panic!("expected replayed response, got {other:?}"),
        }
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test]
    async fn failure_fans_out_to_followers() {
        let registry = Registry::new(DEFAULT_TTL);
        let fingerprint = fp("/users/7");
        let leader = lead(&registry, fingerprint);
        let follower = follow(&registry, fingerprint);

        leader.settle(Outcome::Failed(Error::HandlerFailed {
            reason: "database unavailable".to_string(),
        }));

        match follower.outcome().await {
            Outcome::Failed(err) => {
                assert!(matches!(err, Error::HandlerFailed { .. }));
                assert!(!err.is_retryable());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test]
    async fn settled_flight_does_not_absorb_new_requests() {
        let registry = Registry::new(DEFAULT_TTL);
        let fingerprint = fp("/branches");

        let first = lead(&registry, fingerprint);
        first.settle(captured(200, "first"));
        assert_eq!(registry.inflight(), 0);

        // The next arrival starts a fresh, independent flight.
        let second = lead(&registry, fingerprint);
        assert_eq!(second.followers(), 0);
        second.settle(captured(200, "second"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_releases_followers() {
        let registry = Registry::new(Duration::from_secs(30));
        let fingerprint = fp("/users/1");
        let leader = lead(&registry, fingerprint);
        let follower = follow(&registry, fingerprint);

        // The leader never settles; paused time advances to the reaper's
        // deadline while the follower waits.
        match follower.outcome().await {
            Outcome::Failed(err) => {
                assert!(err.is_retryable());
                assert!(matches!(err, Error::FlightTimeout { after_ms: 30_000 }));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(registry.inflight(), 0);

        // The torn-down flight no longer owns the slot; dropping the stale
        // token must not disturb it.
        drop(leader);
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_settlement_after_deadline_is_dropped() {
        let registry = Registry::new(Duration::from_millis(100));
        let fingerprint = fp("/packages");
        let leader = lead(&registry, fingerprint);
        let follower = follow(&registry, fingerprint);

        let outcome = follower.outcome().await;
        assert!(matches!(
            outcome,
            Outcome::Failed(Error::FlightTimeout { .. })
        ));

        // The leader's real outcome arrives after teardown: shared with no
        // one, and the slot is free for a fresh flight.
        leader.settle(captured(200, "late"));
        let next = lead(&registry, fingerprint);
        next.settle(captured(200, "fresh"));
    }

    #[tokio::test]
    async fn dropped_leader_fails_followers() {
        let registry = Registry::new(DEFAULT_TTL);
        let fingerprint = fp("/packages/track/DEAD");
        let leader = lead(&registry, fingerprint);
        let follower = follow(&registry, fingerprint);

        drop(leader);

        match follower.outcome().await {
            Outcome::Failed(Error::HandlerFailed { .. }) => {}
            other => panic!("expected handler failure, got {other:?}"),
        }
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test]
    async fn dropped_follower_withdraws_interest() {
        let registry = Registry::new(DEFAULT_TTL);
        let fingerprint = fp("/users");
        let leader = lead(&registry, fingerprint);
        let first = follow(&registry, fingerprint);
        let second = follow(&registry, fingerprint);
        assert_eq!(leader.followers(), 2);

        drop(first);
        assert_eq!(leader.followers(), 1);
        assert_eq!(registry.followers(&fingerprint), 1);

        leader.settle(captured(200, "ok"));
        assert!(matches!(second.outcome().await, Outcome::Response(_)));
    }
}
