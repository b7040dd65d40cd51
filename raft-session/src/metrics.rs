//! Observable client session state.
//!
//! Every change to the session's counters or liveness is published on a
//! `watch` channel. The [`Wait`] helper makes it easy for applications and
//! tests to block until the session reaches some condition.

use anyhow::anyhow;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::SessionId;

/// The liveness state of a client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// The session is open and keep-alives are succeeding.
    Connected,
    /// The session was lost: the cluster reported `UnknownSession`, or no
    /// keep-alive succeeded within the session timeout. Terminal.
    Expired,
    /// The session was closed by the client. Terminal.
    Closed,
}

/// A set of metrics describing the current state of a client session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub state: SessionState,
    /// The highest command sequence assigned so far.
    pub command_request: u64,
    /// The highest command sequence whose response has been delivered.
    pub command_response: u64,
    /// The highest log index observed in any response.
    pub response_index: u64,
    /// The highest event sequence consumed.
    pub event_index: u64,
}

impl SessionMetrics {
    pub(crate) fn new_initial(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: SessionState::Connected,
            command_request: 0,
            command_response: 0,
            response_index: 0,
            event_index: 0,
        }
    }
}

/// A handle for waiting on session metrics to satisfy a predicate.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<SessionMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or fail with a timeout.
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<SessionMetrics>
    where T: Fn(&SessionMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        let deadline = Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(anyhow!("timeout waiting for {}; latest: {:?}", msg, latest));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| anyhow!("session task terminated while waiting for {}", msg))?;
                }
            }
        }
    }

    /// Wait for the session to reach the given state.
    pub async fn state(&self, want: SessionState, msg: &str) -> Result<SessionMetrics> {
        self.metrics(|m| m.state == want, msg).await
    }

    /// Wait for `command_response` to reach `want`.
    pub async fn command_response(&self, want: u64, msg: &str) -> Result<SessionMetrics> {
        self.metrics(|m| m.command_response >= want, msg).await
    }
}
