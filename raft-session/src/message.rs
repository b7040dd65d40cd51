//! Wire envelopes and commit-stream record types.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorKind;
use crate::MessageSummary;
use crate::SessionId;

/// Identifies a registered state machine operation.
///
/// Operation ids are opaque tags agreed between the client application and
/// the state machine it drives; the runtime never interprets them.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[display(fmt = "op#{}", _0)]
pub struct OperationId(pub u32);

/// Whether an operation mutates state machine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// A mutating operation, replicated through the log and applied on every
    /// replica in commit order.
    Command,
    /// A read-only operation. Queries never advance logical time and may not
    /// schedule deferred work.
    Query,
}

/// A single operation against the replicated state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The registered handler this operation addresses.
    pub id: OperationId,
    /// Whether the operation mutates state.
    pub kind: OperationKind,
    /// The opaque payload handed to the handler.
    pub payload: Bytes,
}

impl Operation {
    /// Create a new command operation.
    pub fn command(id: OperationId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: OperationKind::Command,
            payload: payload.into(),
        }
    }

    /// Create a new query operation.
    pub fn query(id: OperationId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind: OperationKind::Query,
            payload: payload.into(),
        }
    }
}

impl MessageSummary for Operation {
    fn summary(&self) -> String {
        format!("{} ({:?}, {} bytes)", self.id, self.kind, self.payload.len())
    }
}

/// The consistency level requested for a query.
///
/// The level is honoured by the surrounding Raft engine; the session runtime
/// only carries it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Serve from the contacted replica's applied state.
    Sequential,
    /// Confirm leadership before serving, guarding against stale reads.
    Linearizable,
}

/// The cluster-level outcome carried by every response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Error(ErrorKind),
}

/// An outbound notification from the state machine to a session.
///
/// Events carry a per-session strictly increasing sequence and stay buffered
/// on the server until a keep-alive acknowledges them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub sequence: u64,
    pub payload: Bytes,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A request to open a new session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    /// A client-chosen identifier, used for tracing only.
    pub client_id: String,
    /// The requested session timeout, in milliseconds.
    pub timeout: u64,
}

/// The response to an `OpenSessionRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub status: Status,
    /// The log index at which the session was opened. This is also the
    /// session's id.
    pub index: u64,
    pub session_id: SessionId,
    /// The effective session timeout granted by the cluster, in milliseconds.
    pub timeout: u64,
}

/// A sequenced command against a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session_id: SessionId,
    /// The per-session sequence number assigned at submit time.
    pub sequence: u64,
    pub operation: Operation,
}

impl MessageSummary for CommandRequest {
    fn summary(&self) -> String {
        format!("session={}, seq={}, {}", self.session_id, self.sequence, self.operation.summary())
    }
}

/// The response to a `CommandRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: Status,
    /// The log index at which the command was applied.
    pub index: u64,
    pub result: Bytes,
}

/// A query against a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session_id: SessionId,
    /// The highest log index the client has observed in any response.
    pub last_index: u64,
    /// The sequence of the most recent command submitted before this query.
    pub last_sequence: u64,
    pub operation: Operation,
    pub consistency: Consistency,
}

impl MessageSummary for QueryRequest {
    fn summary(&self) -> String {
        format!(
            "session={}, last_index={}, last_seq={}, {:?}, {}",
            self.session_id,
            self.last_index,
            self.last_sequence,
            self.consistency,
            self.operation.summary()
        )
    }
}

/// The response to a `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: Status,
    /// The log index observed when the query was served.
    pub index: u64,
    pub result: Bytes,
}

/// A periodic liveness beacon, doubling as the acknowledgement vehicle for
/// delivered command responses and session events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: SessionId,
    /// The highest command sequence whose response has been delivered to the
    /// user; the server prunes its response cache up to this point.
    pub command_sequence: u64,
    /// The highest event sequence the client has consumed.
    pub event_index: u64,
}

impl MessageSummary for KeepAliveRequest {
    fn summary(&self) -> String {
        format!(
            "session={}, command_seq={}, event_index={}",
            self.session_id, self.command_sequence, self.event_index
        )
    }
}

/// The response to a `KeepAliveRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: Status,
    pub index: u64,
    /// Events published to the session and not yet acknowledged.
    pub events: Vec<SessionEvent>,
}

/// A request to close a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: SessionId,
}

/// The response to a `CloseSessionRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub status: Status,
    pub index: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// One record from the totally ordered commit stream.
///
/// The surrounding Raft engine guarantees gap-free, strictly increasing
/// `index` values and non-decreasing `timestamp` values; the executor treats
/// a violation of the index invariant as fatal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: u64,
    /// Milliseconds, stamped by the leader and replicated verbatim. This is
    /// the only source of time visible to the state machine.
    pub timestamp: u64,
    pub entry: LogEntry,
}

/// The payload variants of a commit-stream record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogEntry {
    OpenSession {
        client_id: String,
        timeout: u64,
    },
    KeepAlive {
        session_id: SessionId,
        command_sequence: u64,
        event_index: u64,
    },
    CloseSession {
        session_id: SessionId,
    },
    Command {
        session_id: SessionId,
        sequence: u64,
        operation: Operation,
    },
    Query {
        session_id: SessionId,
        operation: Operation,
    },
    /// An entry carrying engine metadata. Applied as a no-op, but still
    /// advances logical time.
    Metadata {
        payload: Bytes,
    },
}

impl MessageSummary for LogRecord {
    fn summary(&self) -> String {
        let entry = match &self.entry {
            LogEntry::OpenSession { client_id, timeout } => {
                format!("open-session: client={}, timeout={}", client_id, timeout)
            }
            LogEntry::KeepAlive { session_id, .. } => format!("keep-alive: session={}", session_id),
            LogEntry::CloseSession { session_id } => format!("close-session: session={}", session_id),
            LogEntry::Command {
                session_id,
                sequence,
                operation,
            } => format!("command: session={}, seq={}, {}", session_id, sequence, operation.summary()),
            LogEntry::Query { session_id, operation } => {
                format!("query: session={}, {}", session_id, operation.summary())
            }
            LogEntry::Metadata { payload } => format!("metadata: {} bytes", payload.len()),
        };
        format!("{}@{}:{}", self.index, self.timestamp, entry)
    }
}
