//! The server-side replicated state machine executor.

mod commit;
mod scheduler;
mod session;
mod snapshot;

pub use self::commit::Commit;
pub use self::scheduler::LogicalScheduler;
pub use self::scheduler::ScheduledEntry;
pub use self::session::CloseReason;
pub use self::session::ServerSession;
pub use self::session::SessionRegistry;

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::error::FatalError;
use crate::error::SnapshotError;
use crate::message::LogEntry;
use crate::message::LogRecord;
use crate::message::Operation;
use crate::message::OperationId;
use crate::message::OperationKind;
use crate::message::SessionEvent;
use crate::MessageSummary;
use crate::SessionId;

use self::commit::CommitPins;

/// The capability a user state machine exposes for log compaction.
///
/// The executor serializes the session registry and scheduler itself; the
/// service only owns its user-state section of the snapshot stream.
pub trait SnapshotService {
    /// Serialize the full user state into the given writer.
    fn snapshot(&self, w: &mut dyn Write) -> anyhow::Result<()>;

    /// Replace the full user state with the serialized form read from `r`.
    fn install(&mut self, r: &mut dyn Read) -> anyhow::Result<()>;
}

/// An operation handler bound to a registered operation id.
///
/// Handlers run on the executor thread, receive exclusive access to the
/// service state, and return the reply bytes for the commit. A returned error
/// becomes an `ApplicationError` reply for that commit only; the session,
/// scheduler and registry all survive.
pub type OperationHandler<S> =
    Box<dyn FnMut(&mut S, &mut OperationContext<'_>, Commit) -> anyhow::Result<Bytes> + Send>;

/// A hook invoked when a session is closed or expired, before its state is
/// discarded. Primitives use this to release session-held resources such as
/// locks.
pub type SessionCloseHook<S> = Box<dyn FnMut(&mut S, SessionId, CloseReason) + Send>;

/// The error returned by [`OperationContext::schedule`] outside a command
/// context. Query handlers run on followers without advancing logical time,
/// so scheduling from one would diverge the replicas.
#[derive(Debug, Error)]
#[error("schedule is only permitted from command handlers and scheduled callbacks")]
pub struct IllegalSchedule;

/// The outcome of applying one commit-stream record.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// An `OpenSession` entry created a session.
    SessionOpened { session_id: SessionId, timeout: u64 },
    /// A `KeepAlive` entry refreshed a session; `events` are the session's
    /// still-unacknowledged events.
    KeptAlive { events: Vec<SessionEvent> },
    /// A `CloseSession` entry removed a session.
    SessionClosed,
    /// A command or query was dispatched to its handler.
    Reply { result: Result<Bytes, ErrorKind> },
    /// A command arrived ahead of a sequence gap and is parked until the gap
    /// fills; its reply will be served from the session's response cache.
    Buffered,
    /// A metadata entry was applied.
    Applied,
}

struct RegisteredOperation<S> {
    kind: OperationKind,
    handler: OperationHandler<S>,
}

/// The view of executor state available to an operation handler.
pub struct OperationContext<'a> {
    scheduler: &'a mut LogicalScheduler,
    sessions: &'a mut SessionRegistry,
    session_id: SessionId,
    index: u64,
    now: u64,
    kind: OperationKind,
}

impl<'a> OperationContext<'a> {
    /// The log index of the commit being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The current logical time, in milliseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// The session on whose behalf the operation runs.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the submitting session is still open.
    pub fn session_open(&self) -> bool {
        self.sessions.contains(self.session_id)
    }

    /// Schedule `operation` to be dispatched when logical time reaches
    /// `now + delay` milliseconds.
    ///
    /// Only permitted from command handlers and scheduled callbacks.
    pub fn schedule(&mut self, delay: u64, operation: Operation) -> Result<(), IllegalSchedule> {
        if self.kind != OperationKind::Command {
            return Err(IllegalSchedule);
        }
        self.scheduler.schedule(self.now.saturating_add(delay), self.session_id, operation);
        Ok(())
    }

    /// Publish an event to the submitting session's outbound buffer,
    /// returning the event's sequence. Returns `None` if the session no
    /// longer exists.
    pub fn publish(&mut self, payload: impl Into<Bytes>) -> Option<u64> {
        self.sessions.publish(self.session_id, payload.into())
    }
}

/// Serialized form of the registry section of a snapshot.
#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    last_applied: u64,
    logical_now: u64,
    sessions: SessionRegistry,
}

/// The single-threaded executor which applies the committed log to a user
/// state machine.
///
/// The executor is the only writer to the session registry, the scheduler
/// and the service; every handler, scheduled callback, close hook and
/// snapshot runs serialized on the caller's thread. The surrounding Raft
/// engine feeds `apply` with committed records in index order.
pub struct StateMachineExecutor<S> {
    service: S,
    handlers: HashMap<OperationId, RegisteredOperation<S>>,
    close_hooks: Vec<SessionCloseHook<S>>,
    sessions: SessionRegistry,
    scheduler: LogicalScheduler,
    pins: CommitPins,
    logical_now: u64,
    last_applied: u64,
    poisoned: bool,
}

enum CommandDisposition {
    Reply(Result<Bytes, ErrorKind>),
    Buffered,
}

impl<S> StateMachineExecutor<S> {
    /// Create a new executor around the given service.
    pub fn new(service: S) -> Self {
        Self {
            service,
            handlers: HashMap::new(),
            close_hooks: Vec::new(),
            sessions: SessionRegistry::new(),
            scheduler: LogicalScheduler::new(),
            pins: CommitPins::default(),
            logical_now: 0,
            last_applied: 0,
            poisoned: false,
        }
    }

    /// Bind a handler to an operation id. Re-registering an id overwrites
    /// the previous handler. Registration must be complete before the first
    /// `apply`.
    pub fn register(&mut self, id: OperationId, kind: OperationKind, handler: OperationHandler<S>) {
        if self.handlers.insert(id, RegisteredOperation { kind, handler }).is_some() {
            tracing::debug!(%id, "operation handler overwritten");
        }
    }

    /// Register a hook to run when a session closes or expires.
    pub fn on_session_close(&mut self, hook: SessionCloseHook<S>) {
        self.close_hooks.push(hook);
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Direct access to the service, for tests and debugging.
    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn scheduler(&self) -> &LogicalScheduler {
        &self.scheduler
    }

    /// The index of the last applied record.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The current logical time, in milliseconds.
    pub fn logical_now(&self) -> u64 {
        self.logical_now
    }

    /// The highest log index the surrounding engine may safely truncate.
    ///
    /// Commits retained by the state machine pin their index; released
    /// (dropped) commits unpin it.
    pub fn compaction_bound(&self) -> u64 {
        match self.pins.lowest() {
            Some(index) => index.saturating_sub(1),
            None => self.last_applied,
        }
    }

    /// Whether a fatal error has poisoned this executor.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Apply one committed record, returning its outcome.
    ///
    /// Before a non-query entry is dispatched, logical time advances to the
    /// record's timestamp, due scheduled entries fire in non-decreasing
    /// `fire_at` order, and sessions whose timeout has lapsed are expired.
    /// Query entries dispatch without touching logical time.
    #[tracing::instrument(level = "debug", skip(self, record), fields(index = record.index))]
    pub fn apply(&mut self, record: LogRecord) -> Result<ApplyOutcome, FatalError> {
        if self.poisoned {
            return Err(FatalError::Poisoned);
        }
        let expected = self.last_applied + 1;
        if record.index != expected {
            self.poisoned = true;
            tracing::error!(expected, got = record.index, "commit stream out of order; poisoning executor");
            return Err(FatalError::OutOfOrderCommit {
                expected,
                got: record.index,
            });
        }
        self.last_applied = record.index;
        tracing::trace!(record = %record.summary(), "applying record");

        match record.entry {
            LogEntry::Query { session_id, operation } => {
                let result = self.apply_query(record.index, session_id, operation);
                Ok(ApplyOutcome::Reply { result })
            }
            entry => {
                self.advance_time(record.timestamp);
                let outcome = match entry {
                    LogEntry::OpenSession { client_id, timeout } => {
                        let session_id = self.sessions.open(record.index, self.logical_now, client_id, timeout);
                        ApplyOutcome::SessionOpened { session_id, timeout }
                    }
                    LogEntry::KeepAlive {
                        session_id,
                        command_sequence,
                        event_index,
                    } => match self.sessions.keep_alive(session_id, command_sequence, event_index, self.logical_now) {
                        Ok(events) => ApplyOutcome::KeptAlive { events },
                        Err(kind) => ApplyOutcome::Reply { result: Err(kind) },
                    },
                    LogEntry::CloseSession { session_id } => match self.sessions.close(session_id) {
                        Some(_) => {
                            tracing::debug!(session = session_id, "session closed");
                            self.run_close_hooks(session_id, CloseReason::Closed);
                            ApplyOutcome::SessionClosed
                        }
                        None => ApplyOutcome::Reply {
                            result: Err(ErrorKind::UnknownSession(session_id)),
                        },
                    },
                    LogEntry::Command {
                        session_id,
                        sequence,
                        operation,
                    } => match self.apply_command(record.index, session_id, sequence, operation) {
                        CommandDisposition::Reply(result) => ApplyOutcome::Reply { result },
                        CommandDisposition::Buffered => ApplyOutcome::Buffered,
                    },
                    LogEntry::Metadata { .. } => ApplyOutcome::Applied,
                    LogEntry::Query { .. } => {
                        // Well controlled by the outer match, but let's log an
                        // error rather than trust it silently.
                        tracing::error!("unreachable branch hit: query entry past the query dispatch arm");
                        ApplyOutcome::Applied
                    }
                };
                Ok(outcome)
            }
        }
    }

    /// Advance logical time to `timestamp`, firing due scheduled entries and
    /// expiring lapsed sessions.
    fn advance_time(&mut self, timestamp: u64) {
        if timestamp > self.logical_now {
            self.logical_now = timestamp;
        }
        self.run_scheduled();
        self.expire_sessions();
    }

    /// Fire every scheduled entry due at the current logical time.
    ///
    /// Entries fired here may schedule further entries; any that land at or
    /// before the current logical time fire in the same pass.
    fn run_scheduled(&mut self) {
        while let Some(entry) = self.scheduler.pop_due(self.logical_now) {
            tracing::debug!(fire_at = entry.fire_at, op = %entry.operation.id, "firing scheduled entry");
            match self.dispatch(self.last_applied, entry.session_id, entry.fire_at, entry.operation) {
                Ok(_) => {}
                Err(kind) => {
                    tracing::warn!(error = %kind, "scheduled entry failed");
                }
            }
        }
    }

    fn expire_sessions(&mut self) {
        for id in self.sessions.expired(self.logical_now) {
            tracing::info!(session = id, now = self.logical_now, "session expired");
            if self.sessions.close(id).is_some() {
                self.run_close_hooks(id, CloseReason::Expired);
            }
        }
    }

    fn run_close_hooks(&mut self, id: SessionId, reason: CloseReason) {
        for hook in self.close_hooks.iter_mut() {
            (hook)(&mut self.service, id, reason);
        }
    }

    fn apply_query(&mut self, index: u64, session_id: SessionId, operation: Operation) -> Result<Bytes, ErrorKind> {
        if !self.sessions.contains(session_id) {
            return Err(ErrorKind::UnknownSession(session_id));
        }
        self.dispatch(index, session_id, self.logical_now, operation)
    }

    /// Apply a sequenced command, enforcing per-session ordering.
    ///
    /// Sequences at or below the session's applied threshold answer from the
    /// response cache (idempotent retries); sequences past the next expected
    /// value park until the gap fills.
    fn apply_command(
        &mut self,
        index: u64,
        session_id: SessionId,
        sequence: u64,
        operation: Operation,
    ) -> CommandDisposition {
        let last = match self.sessions.last_applied_sequence(session_id) {
            Some(last) => last,
            None => return CommandDisposition::Reply(Err(ErrorKind::UnknownSession(session_id))),
        };
        if sequence <= last {
            let reply = self.sessions.cached_reply(session_id, sequence).unwrap_or_else(|| {
                Err(ErrorKind::ProtocolError(format!(
                    "response for sequence {} already acknowledged",
                    sequence
                )))
            });
            return CommandDisposition::Reply(reply);
        }
        if sequence > last + 1 {
            self.sessions.buffer_command(session_id, sequence, index, operation);
            return CommandDisposition::Buffered;
        }

        let reply = self.execute_command(index, session_id, sequence, operation);
        while let Some((seq, idx, op)) = self.sessions.take_next_buffered(session_id) {
            self.execute_command(idx, session_id, seq, op);
        }
        CommandDisposition::Reply(reply)
    }

    fn execute_command(
        &mut self,
        index: u64,
        session_id: SessionId,
        sequence: u64,
        operation: Operation,
    ) -> Result<Bytes, ErrorKind> {
        let reply = self.dispatch(index, session_id, self.logical_now, operation);
        self.sessions.record_reply(session_id, sequence, reply.clone());
        reply
    }

    /// Dispatch one operation to its registered handler.
    fn dispatch(
        &mut self,
        index: u64,
        session_id: SessionId,
        time: u64,
        operation: Operation,
    ) -> Result<Bytes, ErrorKind> {
        let reg = match self.handlers.get_mut(&operation.id) {
            Some(reg) => reg,
            None => return Err(ErrorKind::UnknownOperation(operation.id)),
        };
        if reg.kind != operation.kind {
            return Err(ErrorKind::ProtocolError(format!(
                "operation {} is registered as {:?} but was submitted as {:?}",
                operation.id, reg.kind, operation.kind
            )));
        }
        let kind = reg.kind;
        let pin = self.pins.pin(index);
        let commit = Commit::new(index, session_id, time, operation, pin);
        let mut ctx = OperationContext {
            scheduler: &mut self.scheduler,
            sessions: &mut self.sessions,
            session_id,
            index,
            now: time,
            kind,
        };
        (reg.handler)(&mut self.service, &mut ctx, commit).map_err(|err| reply_error(err, kind))
    }
}

impl<S: SnapshotService> StateMachineExecutor<S> {
    /// Serialize the executor's full state: session registry, scheduler
    /// entries and user state, in that order.
    #[tracing::instrument(level = "debug", skip(self, w), fields(last_applied = self.last_applied))]
    pub fn snapshot<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        snapshot::write_section(w, &RegistrySnapshot {
            last_applied: self.last_applied,
            logical_now: self.logical_now,
            sessions: self.sessions.clone(),
        })?;
        snapshot::write_section(w, &self.scheduler.snapshot_entries())?;
        let mut user = Vec::new();
        self.service.snapshot(&mut user).map_err(SnapshotError::Service)?;
        snapshot::write_raw_section(w, &user)
    }

    /// Replace the executor's full state from a snapshot stream.
    ///
    /// A failure here is fatal: the replica is corrupt and must be discarded
    /// and re-installed by the surrounding engine.
    #[tracing::instrument(level = "debug", skip(self, r))]
    pub fn install<R: Read>(&mut self, r: &mut R) -> Result<(), FatalError> {
        match self.try_install(r) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poisoned = true;
                tracing::error!(error = %err, "snapshot install failed; poisoning executor");
                Err(FatalError::SnapshotInstall(err))
            }
        }
    }

    fn try_install<R: Read>(&mut self, r: &mut R) -> Result<(), SnapshotError> {
        let registry: RegistrySnapshot = snapshot::read_section(r)?;
        let entries: Vec<ScheduledEntry> = snapshot::read_section(r)?;
        let user = snapshot::read_raw_section(r)?;
        self.service.install(&mut user.as_slice()).map_err(SnapshotError::Service)?;
        self.sessions = registry.sessions;
        self.scheduler = LogicalScheduler::restore(entries);
        self.last_applied = registry.last_applied;
        self.logical_now = registry.logical_now;
        Ok(())
    }
}

/// Classify a handler error into a reply-level error kind.
fn reply_error(err: anyhow::Error, kind: OperationKind) -> ErrorKind {
    if err.downcast_ref::<IllegalSchedule>().is_some() {
        return match kind {
            OperationKind::Query => ErrorKind::QueryFailure(err.to_string()),
            OperationKind::Command => ErrorKind::CommandFailure(err.to_string()),
        };
    }
    ErrorKind::ApplicationError(format!("{:#}", err))
}
