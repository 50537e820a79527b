//! Correlation identifiers and their allocator.
//!
//! Every message the gateway publishes carries a small integer `msg_id`;
//! replies echo it back so the engine can find the waiting caller. Requests
//! and intercepts draw from one shared ID space, and an ID returns to the
//! free pool only when its correlation entry is removed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token carried in a payload's `msg_id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw `msg_id` value taken off the wire.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value stamped into outgoing payloads.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

/// Hands out correlation IDs, reusing the most recently freed one first.
///
/// Invariant: at most one pending entry exists per ID at any instant. The
/// correlation table is the only caller and releases an ID exactly once,
/// when the entry is removed (reply, timeout, or cancel).
pub struct IdAllocator {
    inner: Mutex<AllocatorState>,
}

struct AllocatorState {
    /// Next never-used value.
    next: u64,
    /// Freed IDs, reused LIFO.
    free: Vec<u64>,
}

impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocatorState {
                next: 1,
                free: Vec::new(),
            }),
        }
    }

    /// A fresh ID: the most recently freed one if any, else the next
    /// never-used integer.
    pub fn allocate(&self) -> CorrelationId {
        let mut state = self.inner.lock();
        let raw = match state.free.pop() {
            Some(freed) => freed,
            None => {
                let raw = state.next;
                state.next += 1;
                raw
            }
        };
        CorrelationId(raw)
    }

    /// Return an ID to the free pool.
    pub fn release(&self, id: CorrelationId) {
        self.inner.lock().free.push(id.0);
    }

    /// Number of IDs currently handed out.
    #[must_use]
    pub fn live(&self) -> usize {
        let state = self.inner.lock();
        (state.next as usize - 1) - state.free.len()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
