//! The single-threaded client context task.
//!
//! All session state — counters, the sequencer, retry and liveness tracking —
//! is owned by one spawned task. Transport dispatches run on their own tasks
//! and thunk their results back through an internal completion queue, so no
//! state is ever touched off-context.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::error::SubmitError;
use crate::message::CloseSessionRequest;
use crate::message::CommandRequest;
use crate::message::CommandResponse;
use crate::message::Consistency;
use crate::message::KeepAliveRequest;
use crate::message::KeepAliveResponse;
use crate::message::Operation;
use crate::message::OperationKind;
use crate::message::QueryRequest;
use crate::message::QueryResponse;
use crate::message::SessionEvent;
use crate::message::Status;
use crate::metrics::SessionMetrics;
use crate::metrics::SessionState;
use crate::transport::SessionTransport;
use crate::MessageSummary;
use crate::SessionId;

use super::sequencer::SequencedResponse;
use super::sequencer::Sequencer;
use super::state::ClientSessionState;
use super::ClientMsg;

/// A completed dispatch, delivered back onto the context task.
enum CoreEvent {
    Command { sequence: u64, response: CommandResponse },
    Query { id: u64, response: QueryResponse },
    KeepAlive { response: Option<KeepAliveResponse> },
    /// The dispatch observed the session's death and gave up.
    Abandoned,
}

pub(crate) struct ClientCore<T: SessionTransport> {
    session_id: SessionId,
    /// The effective session timeout granted by the cluster, in milliseconds.
    session_timeout: u64,
    /// The keep-alive interval, in milliseconds.
    heartbeat_interval: u64,
    config: Arc<Config>,
    transport: Arc<T>,

    state: ClientSessionState,
    sequencer: Sequencer,
    session_state: SessionState,

    /// The instant of the last successful keep-alive (or of session open).
    last_ack: Instant,
    keep_alive_inflight: bool,

    /// In-flight dispatch tasks.
    in_flight: FuturesUnordered<JoinHandle<CoreEvent>>,
    /// Flipped to `false` when the session dies, stopping orphaned retries.
    tx_alive: watch::Sender<bool>,

    rx_api: mpsc::UnboundedReceiver<ClientMsg>,
    tx_metrics: watch::Sender<SessionMetrics>,
    tx_events: mpsc::UnboundedSender<SessionEvent>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<T: SessionTransport> ClientCore<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        session_id: SessionId,
        session_timeout: u64,
        config: Arc<Config>,
        transport: Arc<T>,
        rx_api: mpsc::UnboundedReceiver<ClientMsg>,
        tx_metrics: watch::Sender<SessionMetrics>,
        tx_events: mpsc::UnboundedSender<SessionEvent>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let heartbeat_interval = config.heartbeat_interval.min((session_timeout / 2).max(1));
        let (tx_alive, _) = watch::channel(true);
        let this = Self {
            session_id,
            session_timeout,
            heartbeat_interval,
            config,
            transport,
            state: ClientSessionState::new(session_id),
            sequencer: Sequencer::new(),
            session_state: SessionState::Connected,
            last_ack: Instant::now(),
            keep_alive_inflight: false,
            in_flight: FuturesUnordered::new(),
            tx_alive,
            rx_api,
            tx_metrics,
            tx_events,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("session", id = session_id)))
    }

    /// The main loop of the client context.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.session_id))]
    async fn main(mut self) {
        let mut ticker = interval(Duration::from_millis(self.heartbeat_interval));
        loop {
            tokio::select! {
                Some(msg) = self.rx_api.recv() => match msg {
                    ClientMsg::Submit { operation, consistency, tx } => {
                        self.handle_submit(operation, consistency, tx);
                    }
                },
                Some(Ok(event)) = self.in_flight.next() => self.handle_event(event),
                _ = ticker.tick() => self.handle_tick(),
                _ = &mut self.rx_shutdown => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Assign ordering state for a submission and start its dispatch.
    ///
    /// Sequence numbers are assigned here, on the context task, so the order
    /// the user observes from `submit` is exactly the order the server
    /// applies, no matter how the transport interleaves.
    fn handle_submit(
        &mut self,
        operation: Operation,
        consistency: Option<Consistency>,
        tx: super::sequencer::Resolver,
    ) {
        match self.session_state {
            SessionState::Connected => {}
            SessionState::Expired => {
                let _ = tx.send(Err(SubmitError::SessionExpired));
                return;
            }
            SessionState::Closed => {
                let _ = tx.send(Err(SubmitError::ShuttingDown));
                return;
            }
        }
        match operation.kind {
            OperationKind::Command => {
                let sequence = self.state.next_command_request();
                self.sequencer.register_command(sequence, tx);
                let req = CommandRequest {
                    session_id: self.session_id,
                    sequence,
                    operation,
                };
                tracing::debug!(req = %req.summary(), "submitting command");
                self.spawn_command_dispatch(req);
            }
            OperationKind::Query => {
                let barrier = self.state.command_request();
                let id = self.sequencer.register_query(barrier, tx);
                let req = QueryRequest {
                    session_id: self.session_id,
                    last_index: self.state.response_index(),
                    last_sequence: barrier,
                    operation,
                    consistency: consistency.unwrap_or(self.config.default_consistency),
                };
                tracing::debug!(req = %req.summary(), "submitting query");
                self.spawn_query_dispatch(id, req);
            }
        }
        self.report_metrics();
    }

    /// Dispatch a command, retrying transport failures and leader changes
    /// with the same sequence number until a terminal response arrives.
    fn spawn_command_dispatch(&mut self, req: CommandRequest) {
        let transport = self.transport.clone();
        let config = self.config.clone();
        let mut alive = self.tx_alive.subscribe();
        let sequence = req.sequence;
        let task = tokio::spawn(
            async move {
                loop {
                    if !*alive.borrow() {
                        return CoreEvent::Abandoned;
                    }
                    match transport.command(req.clone()).await {
                        Ok(response) => match &response.status {
                            Status::Error(ErrorKind::NoLeader(hint)) => {
                                tracing::debug!(sequence, ?hint, "no leader; rebinding and retrying");
                                transport.redirect(*hint);
                            }
                            _ => return CoreEvent::Command { sequence, response },
                        },
                        Err(err) => {
                            tracing::debug!(sequence, error = %err, "command dispatch failed; retrying");
                        }
                    }
                    let backoff = Duration::from_millis(config.new_rand_retry_backoff());
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = alive.changed() => {}
                    }
                }
            }
            .instrument(tracing::debug_span!("dispatch", sequence)),
        );
        self.in_flight.push(task);
    }

    fn spawn_query_dispatch(&mut self, id: u64, req: QueryRequest) {
        let transport = self.transport.clone();
        let config = self.config.clone();
        let mut alive = self.tx_alive.subscribe();
        let task = tokio::spawn(
            async move {
                loop {
                    if !*alive.borrow() {
                        return CoreEvent::Abandoned;
                    }
                    match transport.query(req.clone()).await {
                        Ok(response) => match &response.status {
                            Status::Error(ErrorKind::NoLeader(hint)) => {
                                tracing::debug!(query = id, ?hint, "no leader; rebinding and retrying");
                                transport.redirect(*hint);
                            }
                            _ => return CoreEvent::Query { id, response },
                        },
                        Err(err) => {
                            tracing::debug!(query = id, error = %err, "query dispatch failed; retrying");
                        }
                    }
                    let backoff = Duration::from_millis(config.new_rand_retry_backoff());
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = alive.changed() => {}
                    }
                }
            }
            .instrument(tracing::debug_span!("dispatch-query", id)),
        );
        self.in_flight.push(task);
    }

    /// Send a keep-alive beacon. At most one is in flight at any time.
    fn spawn_keep_alive(&mut self) {
        self.keep_alive_inflight = true;
        let req = KeepAliveRequest {
            session_id: self.session_id,
            command_sequence: self.state.command_response(),
            event_index: self.state.event_index(),
        };
        let transport = self.transport.clone();
        let task = tokio::spawn(
            async move {
                tracing::trace!(req = %req.summary(), "sending keep-alive");
                match transport.keep_alive(req).await {
                    Ok(response) => CoreEvent::KeepAlive {
                        response: Some(response),
                    },
                    Err(err) => {
                        tracing::debug!(error = %err, "keep-alive failed");
                        CoreEvent::KeepAlive { response: None }
                    }
                }
            }
            .instrument(tracing::trace_span!("keep-alive")),
        );
        self.in_flight.push(task);
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Command { sequence, response } => {
                let result = match response.status {
                    Status::Ok => Ok(response.result),
                    Status::Error(ErrorKind::UnknownSession(_)) => {
                        self.expire(SubmitError::UnknownSession(self.session_id));
                        return;
                    }
                    Status::Error(kind) => Err(kind),
                };
                self.sequencer.sequence_command_response(&mut self.state, sequence, SequencedResponse {
                    index: response.index,
                    result,
                });
            }
            CoreEvent::Query { id, response } => {
                let result = match response.status {
                    Status::Ok => Ok(response.result),
                    Status::Error(ErrorKind::UnknownSession(_)) => {
                        self.expire(SubmitError::UnknownSession(self.session_id));
                        return;
                    }
                    Status::Error(kind) => Err(kind),
                };
                self.sequencer.sequence_query_response(&mut self.state, id, SequencedResponse {
                    index: response.index,
                    result,
                });
            }
            CoreEvent::KeepAlive { response } => {
                self.keep_alive_inflight = false;
                if let Some(response) = response {
                    self.handle_keep_alive_response(response);
                }
            }
            CoreEvent::Abandoned => {}
        }
        self.report_metrics();
    }

    fn handle_keep_alive_response(&mut self, response: KeepAliveResponse) {
        match response.status {
            Status::Ok => {
                self.last_ack = Instant::now();
                self.state.observe_response_index(response.index);
                for event in response.events {
                    if event.sequence <= self.state.event_index() {
                        continue;
                    }
                    self.state.observe_event_index(event.sequence);
                    let _ = self.tx_events.send(event);
                }
            }
            Status::Error(ErrorKind::UnknownSession(_)) => {
                // The session was expired server-side while a keep-alive was
                // in flight. Terminal, same as a liveness timeout.
                self.expire(SubmitError::UnknownSession(self.session_id));
            }
            Status::Error(ErrorKind::NoLeader(hint)) => {
                self.transport.redirect(hint);
            }
            Status::Error(kind) => {
                tracing::warn!(error = %kind, "keep-alive rejected");
            }
        }
    }

    fn handle_tick(&mut self) {
        if self.session_state != SessionState::Connected {
            return;
        }
        if self.last_ack.elapsed() >= Duration::from_millis(self.session_timeout) {
            tracing::warn!(
                session = self.session_id,
                timeout = self.session_timeout,
                "no keep-alive acknowledged within the session timeout"
            );
            self.expire(SubmitError::SessionExpired);
            return;
        }
        if !self.keep_alive_inflight {
            self.spawn_keep_alive();
        }
    }

    /// Terminal session-loss handling: fail every pending operation, stop
    /// dispatch retries, and surface the loss through metrics.
    fn expire(&mut self, error: SubmitError) {
        if self.session_state != SessionState::Connected {
            return;
        }
        tracing::warn!(session = self.session_id, error = %error, "session lost");
        self.session_state = SessionState::Expired;
        let _ = self.tx_alive.send(false);
        self.sequencer.fail_all(error);
        self.report_metrics();
    }

    async fn shutdown(&mut self) {
        if self.session_state == SessionState::Connected {
            self.session_state = SessionState::Closed;
            let req = CloseSessionRequest {
                session_id: self.session_id,
            };
            let ttl = Duration::from_millis(self.heartbeat_interval);
            match timeout(ttl, self.transport.close_session(req)).await {
                Ok(Ok(_)) => tracing::debug!(session = self.session_id, "session closed"),
                Ok(Err(err)) => tracing::debug!(error = %err, "close session failed"),
                Err(_elapsed) => tracing::debug!("close session timed out"),
            }
        }
        let _ = self.tx_alive.send(false);
        self.sequencer.fail_all(SubmitError::ShuttingDown);
        self.report_metrics();
    }

    /// Publish a metrics payload describing the current session state.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(SessionMetrics {
            session_id: self.state.session_id(),
            state: self.session_state,
            command_request: self.state.command_request(),
            command_response: self.state.command_response(),
            response_index: self.state.response_index(),
            event_index: self.state.event_index(),
        });
        if let Err(err) = res {
            tracing::debug!(error = %err, "error reporting metrics");
        }
    }
}
