//! Logical-time scheduling of deferred operations.
//!
//! The scheduler holds no closures: an entry names a registered operation to
//! re-dispatch when logical time crosses its deadline. This keeps entries
//! serializable into snapshots and makes replay deterministic on every
//! replica.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use serde::Deserialize;
use serde::Serialize;

use crate::message::Operation;
use crate::SessionId;

/// A deferred operation keyed by the logical time at which it fires.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledEntry {
    /// The logical time, in milliseconds, at which the entry becomes due.
    pub fire_at: u64,
    /// Insertion order; breaks `fire_at` ties.
    pub seq: u64,
    /// The session on whose behalf the operation was scheduled.
    pub session_id: SessionId,
    /// The operation to re-dispatch.
    pub operation: Operation,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The executor's logical-time scheduler.
///
/// Time only advances when a commit is applied; entries fire in
/// non-decreasing `fire_at` order with ties broken by insertion order.
#[derive(Debug, Default)]
pub struct LogicalScheduler {
    heap: BinaryHeap<Reverse<ScheduledEntry>>,
    next_seq: u64,
}

impl LogicalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry firing at the given logical time.
    pub fn schedule(&mut self, fire_at: u64, session_id: SessionId, operation: Operation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledEntry {
            fire_at,
            seq,
            session_id,
            operation,
        }));
    }

    /// Pop the next entry due at or before `now`, if any.
    pub fn pop_due(&mut self, now: u64) -> Option<ScheduledEntry> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.fire_at <= now => self.heap.pop().map(|Reverse(entry)| entry),
            _ => None,
        }
    }

    /// The number of pending entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// All pending entries in firing order, for snapshotting.
    pub(crate) fn snapshot_entries(&self) -> Vec<ScheduledEntry> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(entry)| entry.clone()).collect();
        entries.sort();
        entries
    }

    /// Rebuild a scheduler from snapshotted entries.
    pub(crate) fn restore(entries: Vec<ScheduledEntry>) -> Self {
        let next_seq = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        Self {
            heap: entries.into_iter().map(Reverse).collect(),
            next_seq,
        }
    }
}
