//! Server-side session state and registry.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::message::Operation;
use crate::message::SessionEvent;
use crate::SessionId;

/// Why a session was removed from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the session explicitly.
    Closed,
    /// No keep-alive arrived within the session timeout.
    Expired,
}

/// A command reply retained for idempotent retries.
type CachedReply = Result<Bytes, ErrorKind>;

/// A command buffered because an earlier sequence has not yet been applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BufferedCommand {
    index: u64,
    operation: Operation,
}

/// Server-side state for one client session.
///
/// Mutated only by the executor thread, through applied commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSession {
    id: SessionId,
    client_id: String,
    timeout: u64,
    /// The highest command sequence applied to the state machine.
    last_applied_sequence: u64,
    /// Replies cached for retries, pruned by keep-alive acknowledgement.
    replies: BTreeMap<u64, CachedReply>,
    /// Commands waiting for a sequence gap to fill.
    buffered: BTreeMap<u64, BufferedCommand>,
    next_event_sequence: u64,
    /// Events published and not yet acknowledged.
    events: VecDeque<SessionEvent>,
    /// Logical time of the last keep-alive (or of session open).
    last_keep_alive: u64,
}

impl ServerSession {
    fn new(id: SessionId, client_id: String, timeout: u64, now: u64) -> Self {
        Self {
            id,
            client_id,
            timeout,
            last_applied_sequence: 0,
            replies: BTreeMap::new(),
            buffered: BTreeMap::new(),
            next_event_sequence: 0,
            events: VecDeque::new(),
            last_keep_alive: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The session timeout, in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// The highest command sequence applied for this session.
    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied_sequence
    }

    /// The logical time of the last keep-alive.
    pub fn last_keep_alive(&self) -> u64 {
        self.last_keep_alive
    }

    /// The number of events awaiting acknowledgement.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn is_expired(&self, now: u64) -> bool {
        self.last_keep_alive + self.timeout < now
    }
}

/// Owns every live server session.
///
/// Sessions are kept in a `BTreeMap` so that walks (notably expiration) visit
/// them in the same order on every replica.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, ServerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session. The creating commit's index becomes the session id.
    pub fn open(&mut self, index: u64, now: u64, client_id: String, timeout: u64) -> SessionId {
        tracing::debug!(session = index, client = %client_id, timeout, "opening session");
        self.sessions.insert(index, ServerSession::new(index, client_id, timeout, now));
        index
    }

    /// Record a keep-alive: refresh liveness, prune acknowledged replies and
    /// events, and return the events still awaiting acknowledgement.
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        command_sequence: u64,
        event_index: u64,
        now: u64,
    ) -> Result<Vec<SessionEvent>, ErrorKind> {
        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Err(ErrorKind::UnknownSession(id)),
        };
        session.last_keep_alive = now;
        let kept = session.replies.split_off(&(command_sequence + 1));
        session.replies = kept;
        while let Some(event) = session.events.front() {
            if event.sequence > event_index {
                break;
            }
            session.events.pop_front();
        }
        Ok(session.events.iter().cloned().collect())
    }

    /// Remove a session, returning its final state if it existed.
    pub fn close(&mut self, id: SessionId) -> Option<ServerSession> {
        self.sessions.remove(&id)
    }

    /// The ids of all sessions expired at logical time `now`, in id order.
    pub fn expired(&self, now: u64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id)
            .collect()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ServerSession> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Publish an event to a session's outbound buffer, returning the event's
    /// sequence. Returns `None` if the session no longer exists.
    pub fn publish(&mut self, id: SessionId, payload: Bytes) -> Option<u64> {
        let session = self.sessions.get_mut(&id)?;
        session.next_event_sequence += 1;
        let sequence = session.next_event_sequence;
        session.events.push_back(SessionEvent { sequence, payload });
        Some(sequence)
    }

    pub(crate) fn last_applied_sequence(&self, id: SessionId) -> Option<u64> {
        self.sessions.get(&id).map(|s| s.last_applied_sequence)
    }

    pub(crate) fn cached_reply(&self, id: SessionId, sequence: u64) -> Option<CachedReply> {
        self.sessions.get(&id).and_then(|s| s.replies.get(&sequence).cloned())
    }

    pub(crate) fn record_reply(&mut self, id: SessionId, sequence: u64, reply: CachedReply) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_applied_sequence = sequence;
            session.replies.insert(sequence, reply);
        }
    }

    pub(crate) fn buffer_command(&mut self, id: SessionId, sequence: u64, index: u64, operation: Operation) {
        if let Some(session) = self.sessions.get_mut(&id) {
            tracing::debug!(session = id, sequence, "buffering out-of-order command");
            session.buffered.insert(sequence, BufferedCommand { index, operation });
        }
    }

    /// Take the next buffered command if it is now head-of-line.
    pub(crate) fn take_next_buffered(&mut self, id: SessionId) -> Option<(u64, u64, Operation)> {
        let session = self.sessions.get_mut(&id)?;
        let next = session.last_applied_sequence + 1;
        let cmd = session.buffered.remove(&next)?;
        Some((next, cmd.index, cmd.operation))
    }
}
