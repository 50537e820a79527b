//! The correlation table: every in-flight message, requests and intercepts
//! alike, keyed by one shared ID space.
//!
//! Each entry carries a tagged disposition. `Request` entries complete an
//! HTTP-bound reply slot; `Intercept` entries complete a generic waiter
//! used by internal flows (resolver, delete pipeline). One table means one
//! sweep, one allocator, and one place where the exactly-once rule is
//! enforced: an entry is removed exactly once, by the reply pump or by the
//! sweep, and its ID returns to the pool only at that moment.

use crate::domain::correlation::{CorrelationId, IdAllocator};
use crate::domain::envelope::GatewayReply;
use crate::engine::validate::ReplyValidator;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Reply outcome delivered to an intercept waiter.
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Reply carried the success status; payload is the raw envelope.
    Resolved(Value),
    /// Reply carried a failure status; payload is the raw envelope.
    Rejected { status: i64, envelope: Value },
    /// Reply arrived but its validator refused it.
    Invalid { reason: String, envelope: Value },
    /// The sweep removed the entry past its budget.
    TimedOut,
}

/// Caller-tunable knobs for an intercept registration.
#[derive(Default)]
pub struct InterceptOptions {
    /// Budget before the sweep rejects the entry; the table default applies
    /// when unset.
    pub budget: Option<Duration>,
    /// Hook run when the sweep times the entry out.
    pub on_timeout: Option<Box<dyn FnOnce() + Send + Sync>>,
    /// Validator consulted before the reply resolves.
    pub validator: Option<Arc<dyn ReplyValidator>>,
}

pub(crate) enum Disposition {
    Request {
        reply_tx: oneshot::Sender<GatewayReply>,
        validator: Option<Arc<dyn ReplyValidator>>,
    },
    Intercept {
        outcome_tx: oneshot::Sender<InterceptOutcome>,
        on_timeout: Option<Box<dyn FnOnce() + Send + Sync>>,
        validator: Option<Arc<dyn ReplyValidator>>,
    },
}

pub(crate) struct PendingEntry {
    pub(crate) registered_at: Instant,
    pub(crate) budget: Duration,
    pub(crate) name: String,
    /// Call site that registered the entry, for timeout diagnostics.
    pub(crate) origin: &'static Location<'static>,
    pub(crate) disposition: Disposition,
}

/// Counters kept by the table.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub rejected: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
    pub dropped: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub dropped: u64,
}

/// What one sweep pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub requests: usize,
    pub intercepts: usize,
}

impl SweepReport {
    #[must_use]
    pub fn total(self) -> usize {
        self.requests + self.intercepts
    }
}

/// Registering with an ID that already has a pending entry.
#[derive(Debug, thiserror::Error)]
#[error("correlation id {0} is already pending")]
pub struct DuplicateId(pub CorrelationId);

/// The unified pending-entry table.
pub struct CorrelationTable {
    entries: DashMap<CorrelationId, PendingEntry>,
    ids: IdAllocator,
    request_budget: Duration,
    intercept_budget: Duration,
    stats: Arc<EngineStats>,
}

impl CorrelationTable {
    pub fn new(request_budget: Duration, intercept_budget: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ids: IdAllocator::new(),
            request_budget,
            intercept_budget,
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Register an HTTP-bound request. Exactly one of {matching reply,
    /// sweep timeout} will complete the returned receiver.
    #[track_caller]
    pub fn register_request(
        &self,
        name: &str,
        validator: Option<Arc<dyn ReplyValidator>>,
    ) -> (CorrelationId, oneshot::Receiver<GatewayReply>) {
        self.register_request_at(Location::caller(), name, validator)
    }

    /// Like [`Self::register_request`] with an explicit origin, for
    /// callers that captured the call site themselves.
    pub(crate) fn register_request_at(
        &self,
        origin: &'static Location<'static>,
        name: &str,
        validator: Option<Arc<dyn ReplyValidator>>,
    ) -> (CorrelationId, oneshot::Receiver<GatewayReply>) {
        let id = self.ids.allocate();
        let (reply_tx, rx) = oneshot::channel();
        self.insert_new(
            id,
            name,
            self.request_budget,
            origin,
            Disposition::Request { reply_tx, validator },
        );
        (id, rx)
    }

    /// Register an intercept under a fresh ID.
    #[track_caller]
    pub fn register_intercept(
        &self,
        name: &str,
        options: InterceptOptions,
    ) -> (CorrelationId, oneshot::Receiver<InterceptOutcome>) {
        self.register_intercept_at(Location::caller(), name, options)
    }

    /// Like [`Self::register_intercept`] with an explicit origin.
    pub(crate) fn register_intercept_at(
        &self,
        origin: &'static Location<'static>,
        name: &str,
        options: InterceptOptions,
    ) -> (CorrelationId, oneshot::Receiver<InterceptOutcome>) {
        let id = self.ids.allocate();
        let (outcome_tx, rx) = oneshot::channel();
        self.insert_new(
            id,
            name,
            options.budget.unwrap_or(self.intercept_budget),
            origin,
            Disposition::Intercept {
                outcome_tx,
                on_timeout: options.on_timeout,
                validator: options.validator,
            },
        );
        (id, rx)
    }

    /// Register an intercept under a caller-allocated ID (see
    /// [`Self::allocate_id`]). No explicit budget: the default intercept
    /// budget applies.
    #[track_caller]
    pub fn register_intercept_with_id(
        &self,
        id: CorrelationId,
        name: &str,
    ) -> Result<oneshot::Receiver<InterceptOutcome>, DuplicateId> {
        let (outcome_tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            registered_at: Instant::now(),
            budget: self.intercept_budget,
            name: name.to_string(),
            origin: Location::caller(),
            disposition: Disposition::Intercept {
                outcome_tx,
                on_timeout: None,
                validator: None,
            },
        };
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(DuplicateId(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, name, "Registered pending intercept");
                Ok(rx)
            }
        }
    }

    /// Mint an ID for the caller-allocated registration path. The caller
    /// owns it until it is registered; an unregistered ID is never freed.
    pub fn allocate_id(&self) -> CorrelationId {
        self.ids.allocate()
    }

    /// Remove the entry for a reply. The caller must finish the entry and
    /// then free its ID with [`Self::release_id`], or re-arm it with
    /// [`Self::restore`].
    pub(crate) fn take(&self, id: CorrelationId) -> Option<PendingEntry> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Put an entry back untouched, keeping its original registration
    /// time, so the sweep still owns its timeout.
    pub(crate) fn restore(&self, id: CorrelationId, entry: PendingEntry) {
        self.entries.insert(id, entry);
    }

    /// Return an ID to the pool once its entry is finished.
    pub(crate) fn release_id(&self, id: CorrelationId) {
        self.ids.release(id);
    }

    /// Drop a pending entry without completing it (send failure path).
    pub fn cancel(&self, id: CorrelationId) -> bool {
        if self.entries.remove(&id).is_some() {
            self.ids.release(id);
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Remove every entry past its budget and fire its timeout outcome:
    /// requests get the fixed 504 reply, intercepts are rejected and run
    /// their hook. Freed IDs return to the pool.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.registered_at) > entry.budget)
            .map(|entry| *entry.key())
            .collect();

        let mut report = SweepReport::default();
        for id in expired {
            // Re-check under the removal so a reply that won the race is
            // not timed out as well.
            let Some((_, entry)) = self
                .entries
                .remove_if(&id, |_, e| now.duration_since(e.registered_at) > e.budget)
            else {
                continue;
            };

            warn!(
                correlation_id = %id,
                name = %entry.name,
                origin = %entry.origin,
                elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                "Pending entry expired"
            );

            match entry.disposition {
                Disposition::Request { reply_tx, .. } => {
                    let _ = reply_tx.send(GatewayReply::timeout());
                    report.requests += 1;
                }
                Disposition::Intercept {
                    outcome_tx,
                    on_timeout,
                    ..
                } => {
                    let _ = outcome_tx.send(InterceptOutcome::TimedOut);
                    if let Some(hook) = on_timeout {
                        hook();
                    }
                    report.intercepts += 1;
                }
            }
            self.ids.release(id);
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        report
    }

    /// Number of currently pending entries.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn insert_new(
        &self,
        id: CorrelationId,
        name: &str,
        budget: Duration,
        origin: &'static Location<'static>,
        disposition: Disposition,
    ) {
        let kind = match &disposition {
            Disposition::Request { .. } => "request",
            Disposition::Intercept { .. } => "intercept",
        };
        self.entries.insert(
            id,
            PendingEntry {
                registered_at: Instant::now(),
                budget,
                name: name.to_string(),
                origin,
                disposition,
            },
        );
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, name, kind, "Registered pending entry");
    }
}
