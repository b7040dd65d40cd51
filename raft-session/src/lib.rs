//! Client sessions and a replicated state machine runtime for Raft-based
//! coordination services.
//!
//! The crate has two halves which meet at the wire types in [`message`]:
//!
//! - [`client`] — a session client which submits commands and queries against
//!   a cluster, re-sequences out-of-order responses back into submission
//!   order, and keeps the session alive with a periodic beacon.
//! - [`server`] — a single-threaded executor which applies the totally
//!   ordered commit stream produced by the surrounding Raft engine to a user
//!   state machine, schedules deferred work by logical time, and snapshots
//!   its state for log compaction.
//!
//! The Raft engine itself (election, log replication, storage) is an external
//! collaborator: the server half consumes `(index, timestamp, entry)` records
//! and the client half talks to the cluster through the
//! [`SessionTransport`](crate::transport::SessionTransport) trait.

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod server;
pub mod transport;

pub use crate::client::SessionClient;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::error::ConfigError;
pub use crate::error::ConnectError;
pub use crate::error::ErrorKind;
pub use crate::error::FatalError;
pub use crate::error::SubmitError;
pub use crate::message::Consistency;
pub use crate::message::Operation;
pub use crate::message::OperationId;
pub use crate::message::OperationKind;
pub use crate::metrics::SessionMetrics;
pub use crate::metrics::SessionState;
pub use crate::server::StateMachineExecutor;
pub use crate::transport::SessionTransport;

/// A Raft node's ID.
pub type NodeId = u64;

/// A client session's ID.
///
/// Session ids are the log index of the `OpenSession` commit that created the
/// session, which makes them unique and monotone across the cluster without
/// any extra coordination.
pub type SessionId = u64;

/// A trait defining a compact, log-friendly rendering of a message.
pub trait MessageSummary {
    /// Return a brief summary for logging.
    fn summary(&self) -> String;
}
