//! The client-side session runtime: submitter, sequencer and keep-alive loop.

mod core;
mod sequencer;
mod state;

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::ConnectError;
use crate::error::ErrorKind;
use crate::error::SubmitError;
use crate::message::Consistency;
use crate::message::OpenSessionRequest;
use crate::message::Operation;
use crate::message::SessionEvent;
use crate::message::Status;
use crate::metrics::SessionMetrics;
use crate::metrics::Wait;
use crate::transport::SessionTransport;
use crate::SessionId;

use self::core::ClientCore;
use self::sequencer::Resolver;

use bytes::Bytes;

/// A message coming from the session client API.
pub(crate) enum ClientMsg {
    Submit {
        operation: Operation,
        consistency: Option<Consistency>,
        tx: Resolver,
    },
}

struct ClientInner {
    session_id: SessionId,
    tx_api: mpsc::UnboundedSender<ClientMsg>,
    rx_metrics: watch::Receiver<SessionMetrics>,
    rx_events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    core_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A handle to a live client session.
///
/// Obtained from [`SessionClient::connect`], which opens a session against
/// the cluster and spawns the session's context task. The handle implements
/// `Clone`, and should be cloned liberally: the clone is cheap and all clones
/// drive the same session.
///
/// ### ordering
/// `submit` resolves futures in submission order for commands, regardless of
/// how the transport interleaves responses. Queries resolve after the most
/// recent command submitted before them.
///
/// ### session loss
/// If the cluster forgets the session, or no keep-alive succeeds within the
/// session timeout, every pending and future operation fails and the metrics
/// channel reports [`SessionState::Expired`](crate::metrics::SessionState).
/// Recovery means connecting a new session; per-session state is lost.
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    /// Open a new session against the cluster and spawn its context task.
    ///
    /// Retries transport failures and missing-leader redirects with backoff
    /// until the configured session timeout has elapsed.
    #[tracing::instrument(level = "debug", skip(transport, config), fields(cluster = %config.cluster_name))]
    pub async fn connect<T: SessionTransport>(
        transport: Arc<T>,
        config: Arc<Config>,
    ) -> Result<SessionClient, ConnectError> {
        let client_id = format!("{}-{:016x}", config.cluster_name, rand::random::<u64>());
        let deadline = Instant::now() + Duration::from_millis(config.session_timeout);
        let response = loop {
            let req = OpenSessionRequest {
                client_id: client_id.clone(),
                timeout: config.session_timeout,
            };
            match transport.open_session(req).await {
                Ok(response) => match response.status {
                    Status::Ok => break response,
                    Status::Error(ErrorKind::NoLeader(hint)) => {
                        tracing::debug!(?hint, "no leader while opening session; rebinding");
                        transport.redirect(hint);
                    }
                    Status::Error(kind) => return Err(ConnectError::Rejected(kind)),
                },
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(ConnectError::Transport(err));
                    }
                    tracing::debug!(error = %err, "open session failed; retrying");
                }
            }
            if Instant::now() >= deadline {
                return Err(ConnectError::Transport(anyhow!(
                    "could not open a session within the session timeout"
                )));
            }
            sleep(Duration::from_millis(config.new_rand_retry_backoff())).await;
        };

        tracing::debug!(session = response.session_id, timeout = response.timeout, "session opened");

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(SessionMetrics::new_initial(response.session_id));
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = ClientCore::spawn(
            response.session_id,
            response.timeout,
            config,
            transport,
            rx_api,
            tx_metrics,
            tx_events,
            rx_shutdown,
        );
        let inner = ClientInner {
            session_id: response.session_id,
            tx_api,
            rx_metrics,
            rx_events: Mutex::new(Some(rx_events)),
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Ok(SessionClient {
            inner: Arc::new(inner),
        })
    }

    /// The id of this session.
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Submit an operation, resolving with its result bytes once the response
    /// reaches the head of the session's submission order.
    ///
    /// Commands are assigned a sequence number on the session's context task;
    /// the server applies them in that order exactly once, even across
    /// transport retries. Queries submitted without an explicit consistency
    /// level use the config default.
    #[tracing::instrument(level = "debug", skip(self, operation), fields(op = %operation.id))]
    pub async fn submit(&self, operation: Operation) -> Result<Bytes, SubmitError> {
        self.do_submit(operation, None).await
    }

    /// Submit a query with an explicit consistency level.
    #[tracing::instrument(level = "debug", skip(self, operation), fields(op = %operation.id))]
    pub async fn submit_query(&self, operation: Operation, consistency: Consistency) -> Result<Bytes, SubmitError> {
        self.do_submit(operation, Some(consistency)).await
    }

    /// Submit with a caller-side deadline.
    ///
    /// The timeout is advisory: on expiry the returned future fails with
    /// [`SubmitError::Timeout`], but the cluster may still apply the
    /// operation; its eventual response is consumed and discarded so that
    /// later operations keep sequencing.
    pub async fn submit_with_timeout(&self, operation: Operation, timeout: Duration) -> Result<Bytes, SubmitError> {
        match tokio::time::timeout(timeout, self.submit(operation)).await {
            Ok(res) => res,
            Err(_elapsed) => Err(SubmitError::Timeout),
        }
    }

    async fn do_submit(&self, operation: Operation, consistency: Option<Consistency>) -> Result<Bytes, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ClientMsg::Submit {
                operation,
                consistency,
                tx,
            })
            .map_err(|_| SubmitError::ShuttingDown)?;
        rx.await.map_err(|_| SubmitError::ShuttingDown).and_then(|res| res)
    }

    /// Get a handle to the session metrics channel.
    pub fn metrics(&self) -> watch::Receiver<SessionMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the session metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Take the session's event receiver.
    ///
    /// Events published by the state machine to this session are delivered
    /// here in sequence order. Returns `None` if the receiver was already
    /// taken.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.inner.rx_events.lock().await.take()
    }

    /// Close the session and await the context task's shutdown.
    pub async fn close(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Clone for SessionClient {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
