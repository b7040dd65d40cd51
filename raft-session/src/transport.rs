//! The client-to-cluster transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::CloseSessionRequest;
use crate::message::CloseSessionResponse;
use crate::message::CommandRequest;
use crate::message::CommandResponse;
use crate::message::KeepAliveRequest;
use crate::message::KeepAliveResponse;
use crate::message::OpenSessionRequest;
use crate::message::OpenSessionResponse;
use crate::message::QueryRequest;
use crate::message::QueryResponse;
use crate::NodeId;

/// A trait defining the request/response transport between a session client
/// and some member of the cluster.
///
/// Transport-level failures (timeouts, closed connections) are reported as
/// `Err` and are transparently retried by the client; cluster-level outcomes
/// travel inside the response envelopes as [`Status`](crate::message::Status).
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Open a new session against the cluster.
    async fn open_session(&self, req: OpenSessionRequest) -> Result<OpenSessionResponse>;

    /// Submit a sequenced command.
    async fn command(&self, req: CommandRequest) -> Result<CommandResponse>;

    /// Submit a query.
    async fn query(&self, req: QueryRequest) -> Result<QueryResponse>;

    /// Send a keep-alive beacon.
    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<KeepAliveResponse>;

    /// Close a session.
    async fn close_session(&self, req: CloseSessionRequest) -> Result<CloseSessionResponse>;

    /// Rebind the transport toward the given leader.
    ///
    /// Called when a response carries a `NoLeader` redirect. Implementations
    /// which route to a fixed endpoint may ignore this.
    fn redirect(&self, _leader: Option<NodeId>) {}
}
