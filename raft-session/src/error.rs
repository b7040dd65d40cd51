//! Error types used by the session runtime.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::message::OperationId;
use crate::NodeId;
use crate::SessionId;

/// Error variants which may travel inside a response envelope.
///
/// These are cluster-level outcomes; transport-level failures (timeouts,
/// closed connections) are reported as `Err` from the transport itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
pub enum ErrorKind {
    /// The addressed session does not exist or has been expired.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// No handler is registered for the operation id.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    /// A command was rejected by the state machine runtime.
    #[error("command failed: {0}")]
    CommandFailure(String),
    /// A query was rejected by the state machine runtime.
    #[error("query failed: {0}")]
    QueryFailure(String),
    /// An operation handler returned an error.
    #[error("application error: {0}")]
    ApplicationError(String),
    /// The contacted node is not the leader; the payload carries a hint to
    /// the current leader when one is known.
    #[error("no leader available")]
    NoLeader(Option<NodeId>),
    /// The request violated the session protocol.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// The error type returned by [`SessionClient::submit`](crate::SessionClient::submit).
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SubmitError {
    /// The cluster no longer knows this session. Terminal: every pending and
    /// future operation on the session fails.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// The session's keep-alive beacon failed for longer than the session
    /// timeout. Terminal, as above.
    #[error("session expired")]
    SessionExpired,
    /// No handler is registered on the cluster for the operation id.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    /// The operation itself failed; the surrounding session continues.
    #[error("operation failed: {0}")]
    Operation(ErrorKind),
    /// The caller-supplied timeout elapsed. The cluster may still apply the
    /// operation; its response is consumed and discarded by the sequencer.
    #[error("operation timed out")]
    Timeout,
    /// The client is shutting down.
    #[error("client is shutting down")]
    ShuttingDown,
}

impl From<ErrorKind> for SubmitError {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::UnknownSession(id) => SubmitError::UnknownSession(id),
            ErrorKind::UnknownOperation(id) => SubmitError::UnknownOperation(id),
            other => SubmitError::Operation(other),
        }
    }
}

/// The error type returned by [`SessionClient::connect`](crate::SessionClient::connect).
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport failed before a session could be opened.
    #[error("transport error while opening session: {0}")]
    Transport(anyhow::Error),
    /// The cluster refused to open a session.
    #[error("cluster rejected session open: {0}")]
    Rejected(ErrorKind),
}

/// A non-recoverable executor error.
///
/// Any of these poisons the executor: every later `apply` fails, and the
/// surrounding Raft engine must discard the replica state and re-install a
/// snapshot.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The commit stream delivered an index other than `last_applied + 1`.
    #[error("out of order commit: expected index {expected}, got {got}")]
    OutOfOrderCommit { expected: u64, got: u64 },
    /// Installing a snapshot failed partway through.
    #[error("snapshot install failed: {0}")]
    SnapshotInstall(#[source] SnapshotError),
    /// The executor was poisoned by an earlier fatal error.
    #[error("state machine executor poisoned by an earlier fatal error")]
    Poisoned,
}

/// An error raised while writing or reading a snapshot stream.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Codec(#[from] bincode::Error),
    /// The user state machine failed to serialize or install its section.
    #[error("service snapshot failed: {0}")]
    Service(anyhow::Error),
}

/// Errors raised by [`ConfigBuilder::validate`](crate::ConfigBuilder::validate).
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error("session timeout must be greater than zero")]
    SessionTimeoutTooSmall,
    #[error("heartbeat interval must be non-zero and shorter than the session timeout")]
    HeartbeatOutOfRange,
    #[error("retry backoff bounds must satisfy 0 < min < max")]
    InvalidRetryBackoff,
}
