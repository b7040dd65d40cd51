//! Re-orders asynchronous responses back into submission order.
//!
//! Commands are submitted with strictly increasing sequence numbers, but the
//! transport may complete their responses in any order (retries, different
//! connections). The sequencer holds one resolver per pending operation and
//! releases them head-of-line: command `r` completes only after command
//! `r - 1`, and a query completes only after the command it was submitted
//! behind.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::ErrorKind;
use crate::error::SubmitError;

use super::state::ClientSessionState;

/// The resolver capability for one pending operation.
pub(crate) type Resolver = oneshot::Sender<Result<Bytes, SubmitError>>;

/// A response as observed by the sequencer: the applied (or observed) log
/// index plus either result bytes or a typed error.
#[derive(Debug)]
pub(crate) struct SequencedResponse {
    pub index: u64,
    pub result: Result<Bytes, ErrorKind>,
}

struct PendingCommand {
    resolver: Resolver,
    response: Option<SequencedResponse>,
}

struct PendingQuery {
    /// The command sequence this query is barriered behind.
    barrier: u64,
    resolver: Resolver,
    response: Option<SequencedResponse>,
}

/// Holds pending resolvers and releases them in submission order.
#[derive(Default)]
pub(crate) struct Sequencer {
    commands: BTreeMap<u64, PendingCommand>,
    /// Queries keyed by an insertion-ordered id.
    queries: BTreeMap<u64, PendingQuery>,
    next_query_id: u64,
}

impl Sequencer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a pending command under its sequence number.
    pub(crate) fn register_command(&mut self, sequence: u64, resolver: Resolver) {
        self.commands.insert(sequence, PendingCommand {
            resolver,
            response: None,
        });
    }

    /// Record a pending query barriered behind the given command sequence,
    /// returning its id.
    pub(crate) fn register_query(&mut self, barrier: u64, resolver: Resolver) -> u64 {
        self.next_query_id += 1;
        let id = self.next_query_id;
        self.queries.insert(id, PendingQuery {
            barrier,
            resolver,
            response: None,
        });
        id
    }

    /// Sequence a command response.
    ///
    /// If the response is head-of-line it completes immediately and drains
    /// any buffered successors (and any queries they unblock); otherwise it
    /// is buffered in its slot. Responses for sequences with no slot (late
    /// retries) are dropped.
    pub(crate) fn sequence_command_response(
        &mut self,
        state: &mut ClientSessionState,
        sequence: u64,
        response: SequencedResponse,
    ) {
        state.observe_response_index(response.index);
        match self.commands.get_mut(&sequence) {
            None => {
                tracing::debug!(sequence, "dropping response with no pending slot");
                return;
            }
            Some(slot) => slot.response = Some(response),
        }
        self.drain(state);
    }

    /// Sequence a query response.
    ///
    /// The query completes as soon as its own response has arrived and the
    /// command it was submitted behind has been delivered.
    pub(crate) fn sequence_query_response(
        &mut self,
        state: &mut ClientSessionState,
        id: u64,
        response: SequencedResponse,
    ) {
        state.observe_response_index(response.index);
        match self.queries.get_mut(&id) {
            None => {
                tracing::debug!(query = id, "dropping query response with no pending slot");
                return;
            }
            Some(slot) => slot.response = Some(response),
        }
        self.drain_queries(state);
    }

    /// Fail every pending operation with the given error. Used when the
    /// session is lost or the client shuts down.
    pub(crate) fn fail_all(&mut self, error: SubmitError) {
        let commands = std::mem::take(&mut self.commands);
        for (_, slot) in commands {
            let _ = slot.resolver.send(Err(error.clone()));
        }
        let queries = std::mem::take(&mut self.queries);
        for (_, slot) in queries {
            let _ = slot.resolver.send(Err(error.clone()));
        }
    }

    /// Release every head-of-line command whose response has arrived, then
    /// any queries those completions unblock.
    fn drain(&mut self, state: &mut ClientSessionState) {
        loop {
            let next = state.command_response() + 1;
            let ready = match self.commands.get(&next) {
                Some(slot) => slot.response.is_some(),
                None => false,
            };
            if !ready {
                break;
            }
            // The checks above guarantee both the slot and its response.
            if let Some(slot) = self.commands.remove(&next) {
                if let Some(response) = slot.response {
                    let _ = slot.resolver.send(response.result.map_err(SubmitError::from));
                }
            }
            state.set_command_response(next);
        }
        self.drain_queries(state);
    }

    fn drain_queries(&mut self, state: &mut ClientSessionState) {
        let delivered = state.command_response();
        let ready: Vec<u64> = self
            .queries
            .iter()
            .filter(|(_, slot)| slot.barrier <= delivered && slot.response.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(slot) = self.queries.remove(&id) {
                if let Some(response) = slot.response {
                    let _ = slot.resolver.send(response.result.map_err(SubmitError::from));
                }
            }
        }
    }
}
