//! TTL notify cache with forced single-flight.
//!
//! One instance caches one entity category. Values expire after a TTL and
//! are lazily evicted on access. Concurrent lookups for the same uncached
//! key are coalesced: [`TtlNotifyCache::join_flight`] atomically elects one
//! leader, who performs the fetch and completes the flight, while every
//! other caller becomes a follower awaiting the leader's value. The
//! election happens inside the cache, so coalescing cannot be bypassed by
//! a caller forgetting to check for an in-flight fetch.
//!
//! In-flight markers and waiters are themselves TTL-bounded: a wedged
//! leader stops blocking the key once its marker ages out, and a stuck
//! waiter is reaped instead of waiting forever.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Default budget for an in-flight marker.
pub const DEFAULT_FLIGHT_TTL: Duration = Duration::from_secs(10);
/// Default budget for a registered waiter.
pub const DEFAULT_WAITER_TTL: Duration = Duration::from_secs(10);

struct CacheElement<T> {
    value: T,
    inserted_at: Instant,
}

struct FlightMarker {
    started_at: Instant,
    /// Distinguishes a marker from the guard that created it, so a
    /// displaced leader cannot tear down its successor's flight.
    token: u64,
}

struct Waiter<T> {
    tx: oneshot::Sender<FlightOutcome<T>>,
    registered_at: Instant,
}

/// What a waiter observes when its flight ends.
#[derive(Debug)]
enum FlightOutcome<T> {
    Ready(T),
    LeaderFailed,
}

/// Keyed cache for one entity category.
pub struct TtlNotifyCache<T> {
    entries: DashMap<String, CacheElement<T>>,
    flights: DashMap<String, FlightMarker>,
    waiters: DashMap<String, Vec<Waiter<T>>>,
    flight_seq: AtomicU64,
    ttl: Duration,
    flight_ttl: Duration,
    waiter_ttl: Duration,
}

/// Result of joining a fetch for a key.
pub enum Flight<'a, T> {
    /// The value was cached and fresh.
    Hit(T),
    /// This caller owns the fetch; it must complete or abandon the guard.
    Leader(FlightGuard<'a, T>),
    /// Another caller is fetching; await its outcome.
    Follower(FlightWaiter<T>),
}

impl<T> TtlNotifyCache<T> {
    /// Create a cache with the given value TTL and default flight budgets.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_budgets(ttl, DEFAULT_FLIGHT_TTL, DEFAULT_WAITER_TTL)
    }

    /// Create a cache with explicit value, flight, and waiter budgets.
    #[must_use]
    pub fn with_budgets(ttl: Duration, flight_ttl: Duration, waiter_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            flights: DashMap::new(),
            waiters: DashMap::new(),
            flight_seq: AtomicU64::new(0),
            ttl,
            flight_ttl,
            waiter_ttl,
        }
    }

    /// Cached value, if present and younger than the TTL. A stale element
    /// is treated as absent and lazily evicted.
    pub fn get(&self, id: &str) -> Option<T>
    where
        T: Clone,
    {
        {
            let element = self.entries.get(id)?;
            if element.inserted_at.elapsed() < self.ttl {
                return Some(element.value.clone());
            }
        }
        // Guard dropped above; re-check freshness so a concurrent
        // re-insert is not evicted.
        self.entries
            .remove_if(id, |_, e| e.inserted_at.elapsed() >= self.ttl);
        None
    }

    /// Store a value, clear the key's in-flight marker, and notify every
    /// fresh waiter with a copy.
    pub fn insert(&self, id: impl Into<String>, value: T)
    where
        T: Clone,
    {
        let id = id.into();
        self.entries.insert(
            id.clone(),
            CacheElement {
                value: value.clone(),
                inserted_at: Instant::now(),
            },
        );
        self.flights.remove(&id);
        if let Some((_, waiters)) = self.waiters.remove(&id) {
            let notified = self.notify(waiters, || FlightOutcome::Ready(value.clone()));
            if notified > 0 {
                debug!(key = %id, notified, "Cache insert notified waiters");
            }
        }
    }

    /// Register for the next `insert` of this key. Prefer
    /// [`Self::join_flight`], which also elects the fetcher; `subscribe`
    /// alone does not prevent a concurrent caller from fetching too.
    pub fn subscribe(&self, id: &str) -> FlightWaiter<T> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.waiters.entry(id.to_string()).or_default();
        slot.retain(|w| !w.tx.is_closed() && w.registered_at.elapsed() <= self.waiter_ttl);
        slot.push(Waiter {
            tx,
            registered_at: Instant::now(),
        });
        FlightWaiter {
            rx,
            budget: self.waiter_ttl,
        }
    }

    /// Join the fetch for a key: a fresh cached value is a hit, the first
    /// caller on an uncached key becomes the leader, and everyone else
    /// becomes a follower. The decision is atomic per key.
    pub fn join_flight(&self, id: &str) -> Flight<'_, T>
    where
        T: Clone,
    {
        if let Some(value) = self.get(id) {
            return Flight::Hit(value);
        }

        match self.flights.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at.elapsed() > self.flight_ttl {
                    // Wedged leader; displace its marker and take over.
                    let token = self.next_token();
                    occupied.insert(self.marker(token));
                    debug!(key = %id, "Stale flight marker displaced");
                    return Flight::Leader(self.guard(id, token));
                }
                // Register while the flight entry is held, so a completing
                // leader cannot drain the waiter list past this one.
                let (tx, rx) = oneshot::channel();
                self.waiters.entry(id.to_string()).or_default().push(Waiter {
                    tx,
                    registered_at: Instant::now(),
                });
                Flight::Follower(FlightWaiter {
                    rx,
                    budget: self.waiter_ttl,
                })
            }
            Entry::Vacant(vacant) => {
                let token = self.next_token();
                vacant.insert(self.marker(token));
                Flight::Leader(self.guard(id, token))
            }
        }
    }

    /// Whether a fresh in-flight marker exists for this key.
    #[must_use]
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.flights
            .get(id)
            .map(|m| m.started_at.elapsed() <= self.flight_ttl)
            .unwrap_or(false)
    }

    /// Number of stored elements, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_token(&self) -> u64 {
        self.flight_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn marker(&self, token: u64) -> FlightMarker {
        FlightMarker {
            started_at: Instant::now(),
            token,
        }
    }

    fn guard(&self, id: &str, token: u64) -> FlightGuard<'_, T> {
        FlightGuard {
            cache: self,
            id: id.to_string(),
            token,
            done: false,
        }
    }

    fn notify(
        &self,
        waiters: Vec<Waiter<T>>,
        mut outcome: impl FnMut() -> FlightOutcome<T>,
    ) -> usize {
        let mut notified = 0;
        for waiter in waiters {
            if waiter.registered_at.elapsed() > self.waiter_ttl {
                continue; // reaped
            }
            if waiter.tx.send(outcome()).is_ok() {
                notified += 1;
            }
        }
        notified
    }
}

/// Exclusive right to fetch one key. Complete it with the fetched value,
/// or drop it to release the key and fail any followers.
pub struct FlightGuard<'a, T> {
    cache: &'a TtlNotifyCache<T>,
    id: String,
    token: u64,
    done: bool,
}

impl<T: Clone> FlightGuard<'_, T> {
    /// Key this flight owns.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.id
    }

    /// Publish the fetched value: caches it and notifies followers.
    pub fn complete(mut self, value: T) {
        self.done = true;
        let id = std::mem::take(&mut self.id);
        self.cache.insert(id, value);
    }

    /// Give the key up without a value. Followers observe a failed flight
    /// and the next joiner becomes leader.
    pub fn abandon(self) {
        // Drop does the work.
    }
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let id = std::mem::take(&mut self.id);
        // Only tear down the flight this guard still owns; a displaced
        // marker belongs to a newer leader.
        let removed = self
            .cache
            .flights
            .remove_if(&id, |_, m| m.token == self.token)
            .is_some();
        if !removed {
            return;
        }
        debug!(key = %id, "Flight abandoned without a value");
        if let Some((_, waiters)) = self.cache.waiters.remove(&id) {
            self.cache.notify(waiters, || FlightOutcome::LeaderFailed);
        }
    }
}

/// Follower half of a coalesced fetch.
pub struct FlightWaiter<T> {
    rx: oneshot::Receiver<FlightOutcome<T>>,
    budget: Duration,
}

impl<T> FlightWaiter<T> {
    /// Resolve when the leader completes. Errs when the leader abandoned
    /// the flight or the waiter budget lapsed first.
    pub async fn wait(self) -> Result<T, WaitError> {
        match tokio::time::timeout(self.budget, self.rx).await {
            Ok(Ok(FlightOutcome::Ready(value))) => Ok(value),
            Ok(Ok(FlightOutcome::LeaderFailed)) => Err(WaitError::LeaderFailed),
            // Sender dropped without a word: the waiter was reaped.
            Ok(Err(_)) => Err(WaitError::Expired),
            Err(_) => Err(WaitError::Expired),
        }
    }
}

/// Why a coalesced wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The leader gave up without caching a value.
    #[error("coalesced fetch failed before a value was cached")]
    LeaderFailed,
    /// The waiter budget lapsed.
    #[error("coalesced fetch expired")]
    Expired,
}
