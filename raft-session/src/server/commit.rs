//! Commit records and compaction pinning.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::Operation;
use crate::SessionId;

/// Tracks which commit indexes are still pinned by live [`Commit`] values.
///
/// The surrounding Raft engine must not truncate the log past a pinned index;
/// [`StateMachineExecutor::compaction_bound`](super::StateMachineExecutor::compaction_bound)
/// exposes the safe truncation point.
#[derive(Clone, Debug, Default)]
pub(crate) struct CommitPins {
    inner: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl CommitPins {
    pub(crate) fn pin(&self, index: u64) -> PinGuard {
        *self.inner.lock().entry(index).or_insert(0) += 1;
        PinGuard {
            index,
            pins: self.inner.clone(),
        }
    }

    pub(crate) fn lowest(&self) -> Option<u64> {
        self.inner.lock().keys().next().copied()
    }
}

#[derive(Debug)]
pub(crate) struct PinGuard {
    index: u64,
    pins: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&self.index) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.index);
            }
        }
    }
}

/// One applied operation from the commit stream, as seen by a handler.
///
/// Commits are cheap to clone. A state machine may retain clones past the
/// handler invocation; all clones of one commit share a single compaction
/// pin, released when the last clone is dropped. Holding a commit therefore
/// pins its log index from compaction, but leaking one is never a
/// correctness violation.
#[derive(Clone, Debug)]
pub struct Commit {
    index: u64,
    session_id: SessionId,
    time: u64,
    operation: Operation,
    _pin: Arc<PinGuard>,
}

impl Commit {
    pub(crate) fn new(index: u64, session_id: SessionId, time: u64, operation: Operation, pin: PinGuard) -> Self {
        Self {
            index,
            session_id,
            time,
            operation,
            _pin: Arc::new(pin),
        }
    }

    /// The log index at which this operation was committed.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The session which submitted the operation.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The logical time of the commit, in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// The operation being applied.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The operation's opaque payload.
    pub fn value(&self) -> &Bytes {
        &self.operation.payload
    }
}
