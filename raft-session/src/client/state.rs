//! Client-side session counters.

use crate::SessionId;

/// The mutable per-session counters, touched only from the client core task.
///
/// No synchronization is needed: every mutation happens on the session's
/// single context task.
#[derive(Debug)]
pub(crate) struct ClientSessionState {
    session_id: SessionId,
    /// The highest command sequence assigned so far.
    command_request: u64,
    /// The highest command sequence whose response has been delivered.
    command_response: u64,
    /// The highest log index observed in any response.
    response_index: u64,
    /// The highest event sequence consumed.
    event_index: u64,
}

impl ClientSessionState {
    pub(crate) fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            command_request: 0,
            command_response: 0,
            response_index: 0,
            event_index: 0,
        }
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Assign the next command sequence.
    pub(crate) fn next_command_request(&mut self) -> u64 {
        self.command_request += 1;
        self.command_request
    }

    pub(crate) fn command_request(&self) -> u64 {
        self.command_request
    }

    pub(crate) fn command_response(&self) -> u64 {
        self.command_response
    }

    /// Advance the delivered-response watermark. Regressions are ignored.
    pub(crate) fn set_command_response(&mut self, sequence: u64) {
        if sequence > self.command_response {
            self.command_response = sequence;
        }
    }

    pub(crate) fn response_index(&self) -> u64 {
        self.response_index
    }

    /// Observe a response's log index; keeps the monotone maximum.
    pub(crate) fn observe_response_index(&mut self, index: u64) {
        if index > self.response_index {
            self.response_index = index;
        }
    }

    pub(crate) fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Observe a consumed event sequence; keeps the monotone maximum.
    pub(crate) fn observe_event_index(&mut self, sequence: u64) {
        if sequence > self.event_index {
            self.event_index = sequence;
        }
    }
}
