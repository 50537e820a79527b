//! Retry queue for failed delete actions.
//!
//! In-memory and passive: recording an entry never schedules anything.
//! An operator (or a test) asks for the due entries and re-drives them
//! explicitly; the gateway itself only ever appends.

use super::pipeline::{PipelineId, RetryBackoff};
use crate::domain::entities::EntityRef;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// One failed delete action awaiting a retry.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub pipeline: PipelineId,
    pub target: EntityRef,
    pub service: &'static str,
    pub routing_key: String,
    /// Error history, oldest first.
    pub errors: Vec<String>,
    pub attempts: u32,
    pub next_retry: DateTime<Utc>,
}

/// Append-only retry queue shared by every delete pipeline.
pub struct RetryOutbox {
    entries: Mutex<Vec<OutboxEntry>>,
    backoff: RetryBackoff,
}

impl RetryOutbox {
    #[must_use]
    pub fn new(backoff: RetryBackoff) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            backoff,
        }
    }

    /// When the next attempt should run, after `failures` failed ones.
    #[must_use]
    pub fn next_retry_after(&self, failures: u32) -> DateTime<Utc> {
        match ChronoDuration::from_std(self.backoff.delay(failures)) {
            Ok(delay) => Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    /// Park a failed action. Any earlier entry for the same pipeline and
    /// service is replaced, so one action never queues twice.
    pub fn record(&self, entry: OutboxEntry) {
        let mut entries = self.entries.lock();
        entries.retain(|e| !(e.pipeline == entry.pipeline && e.service == entry.service));
        entries.push(entry);
    }

    /// Entries whose retry time has passed, leaving them queued.
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.next_retry <= now)
            .cloned()
            .collect()
    }

    /// Remove and return the entries whose retry time has passed.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<OutboxEntry> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        entries.retain(|e| {
            if e.next_retry <= now {
                due.push(e.clone());
                false
            } else {
                true
            }
        });
        due
    }

    /// Every queued entry, due or not.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn backoff(&self) -> RetryBackoff {
        self.backoff
    }
}
