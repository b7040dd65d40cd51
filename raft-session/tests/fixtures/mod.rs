//! Fixtures for testing the session runtime.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing_subscriber::prelude::*;

use memkv::KvRequest;
use memkv::MemKv;
use raft_session::error::ErrorKind;
use raft_session::message::CloseSessionRequest;
use raft_session::message::CloseSessionResponse;
use raft_session::message::CommandRequest;
use raft_session::message::CommandResponse;
use raft_session::message::KeepAliveRequest;
use raft_session::message::KeepAliveResponse;
use raft_session::message::LogEntry;
use raft_session::message::LogRecord;
use raft_session::message::OpenSessionRequest;
use raft_session::message::OpenSessionResponse;
use raft_session::message::QueryRequest;
use raft_session::message::QueryResponse;
use raft_session::message::SessionEvent;
use raft_session::message::Status;
use raft_session::server::ApplyOutcome;
use raft_session::server::StateMachineExecutor;
use raft_session::Config;
use raft_session::SessionId;
use raft_session::SessionTransport;

/// Initialize the tracing system. Safe to call from every test; later calls
/// are ignored once a subscriber is installed.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A client config with a long session timeout, for tests which drive the
/// transport by hand.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .session_timeout(10_000)
            .heartbeat_interval(2_000)
            .retry_backoff(10, 50)
            .validate()
            .expect("failed to build config"),
    )
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Commit-stream record builders for executor-level tests.

pub fn open_session_record(index: u64, timestamp: u64, timeout: u64) -> LogRecord {
    LogRecord {
        index,
        timestamp,
        entry: LogEntry::OpenSession {
            client_id: format!("test-{}", index),
            timeout,
        },
    }
}

pub fn command_record(index: u64, timestamp: u64, session_id: SessionId, sequence: u64, req: &KvRequest) -> LogRecord {
    LogRecord {
        index,
        timestamp,
        entry: LogEntry::Command {
            session_id,
            sequence,
            operation: req.to_operation().expect("failed to encode request"),
        },
    }
}

pub fn query_record(index: u64, timestamp: u64, session_id: SessionId, req: &KvRequest) -> LogRecord {
    LogRecord {
        index,
        timestamp,
        entry: LogEntry::Query {
            session_id,
            operation: req.to_operation().expect("failed to encode request"),
        },
    }
}

pub fn keep_alive_record(
    index: u64,
    timestamp: u64,
    session_id: SessionId,
    command_sequence: u64,
    event_index: u64,
) -> LogRecord {
    LogRecord {
        index,
        timestamp,
        entry: LogEntry::KeepAlive {
            session_id,
            command_sequence,
            event_index,
        },
    }
}

pub fn noop_record(index: u64, timestamp: u64) -> LogRecord {
    LogRecord {
        index,
        timestamp,
        entry: LogEntry::Metadata { payload: Bytes::new() },
    }
}

/// Unwrap a `Reply` outcome into its result bytes, panicking on anything else.
pub fn reply_bytes(outcome: ApplyOutcome) -> Bytes {
    match outcome {
        ApplyOutcome::Reply { result } => result.expect("operation replied with an error"),
        other => panic!("expected a reply, got {:?}", other),
    }
}

/// Apply a record to an executor, unwrapping fatal errors.
pub fn apply(executor: &mut StateMachineExecutor<MemKv>, record: LogRecord) -> ApplyOutcome {
    executor.apply(record).expect("fatal executor error")
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A transport whose requests are parked until the test completes them,
/// allowing responses to be delivered in any order.
pub struct ManualTransport {
    inner: Mutex<ManualInner>,
    notify: Notify,
    fail_keep_alives: AtomicBool,
    acked_event_index: AtomicU64,
}

#[derive(Default)]
struct ManualInner {
    commands: VecDeque<CapturedCommand>,
    queries: VecDeque<CapturedQuery>,
    pending_events: Vec<SessionEvent>,
}

/// A command captured by the [`ManualTransport`], waiting for the test to
/// complete it.
pub struct CapturedCommand {
    pub request: CommandRequest,
    tx: oneshot::Sender<Result<CommandResponse>>,
}

impl CapturedCommand {
    pub fn complete(self, index: u64, result: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(CommandResponse {
            status: Status::Ok,
            index,
            result: result.into(),
        }));
    }

    pub fn fail(self, index: u64, kind: ErrorKind) {
        let _ = self.tx.send(Ok(CommandResponse {
            status: Status::Error(kind),
            index,
            result: Bytes::new(),
        }));
    }

    pub fn fail_transport(self, msg: &str) {
        let _ = self.tx.send(Err(anyhow!("{}", msg.to_string())));
    }
}

/// A query captured by the [`ManualTransport`].
pub struct CapturedQuery {
    pub request: QueryRequest,
    tx: oneshot::Sender<Result<QueryResponse>>,
}

impl CapturedQuery {
    pub fn complete(self, index: u64, result: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(QueryResponse {
            status: Status::Ok,
            index,
            result: result.into(),
        }));
    }

    pub fn fail(self, index: u64, kind: ErrorKind) {
        let _ = self.tx.send(Ok(QueryResponse {
            status: Status::Error(kind),
            index,
            result: Bytes::new(),
        }));
    }
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManualInner::default()),
            notify: Notify::new(),
            fail_keep_alives: AtomicBool::new(false),
            acked_event_index: AtomicU64::new(0),
        })
    }

    /// Wait for the next command dispatched by the client.
    pub async fn next_command(&self) -> CapturedCommand {
        loop {
            if let Some(cmd) = self.inner.lock().expect("lock").commands.pop_front() {
                return cmd;
            }
            self.notify.notified().await;
        }
    }

    /// Wait for the next query dispatched by the client.
    pub async fn next_query(&self) -> CapturedQuery {
        loop {
            if let Some(query) = self.inner.lock().expect("lock").queries.pop_front() {
                return query;
            }
            self.notify.notified().await;
        }
    }

    /// Make subsequent keep-alives fail at the transport level.
    pub fn set_fail_keep_alives(&self, fail: bool) {
        self.fail_keep_alives.store(fail, Ordering::SeqCst);
    }

    /// Stage events to be returned by the next keep-alive response.
    pub fn stage_events(&self, events: Vec<SessionEvent>) {
        self.inner.lock().expect("lock").pending_events.extend(events);
    }

    /// The highest event sequence a keep-alive request has acknowledged.
    pub fn acked_event_index(&self) -> u64 {
        self.acked_event_index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionTransport for ManualTransport {
    async fn open_session(&self, req: OpenSessionRequest) -> Result<OpenSessionResponse> {
        Ok(OpenSessionResponse {
            status: Status::Ok,
            index: 1,
            session_id: 1,
            timeout: req.timeout,
        })
    }

    async fn command(&self, req: CommandRequest) -> Result<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().expect("lock").commands.push_back(CapturedCommand { request: req, tx });
        self.notify.notify_one();
        rx.await.map_err(|_| anyhow!("test transport dropped the command"))?
    }

    async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().expect("lock").queries.push_back(CapturedQuery { request: req, tx });
        self.notify.notify_one();
        rx.await.map_err(|_| anyhow!("test transport dropped the query"))?
    }

    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<KeepAliveResponse> {
        self.acked_event_index.store(req.event_index, Ordering::SeqCst);
        if self.fail_keep_alives.load(Ordering::SeqCst) {
            bail!("keep-alive dropped");
        }
        let events = std::mem::take(&mut self.inner.lock().expect("lock").pending_events);
        Ok(KeepAliveResponse {
            status: Status::Ok,
            index: 0,
            events,
        })
    }

    async fn close_session(&self, _req: CloseSessionRequest) -> Result<CloseSessionResponse> {
        Ok(CloseSessionResponse {
            status: Status::Ok,
            index: 0,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A single-replica in-process cluster: every request is appended to a local
/// log and applied to a `MemKv` executor, with a logical clock that ticks
/// once per record.
pub struct SingleNode {
    inner: tokio::sync::Mutex<NodeInner>,
}

struct NodeInner {
    executor: StateMachineExecutor<MemKv>,
    index: u64,
    clock: u64,
}

impl SingleNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(NodeInner {
                executor: MemKv::executor(),
                index: 0,
                clock: 0,
            }),
        })
    }

    async fn append(&self, entry: LogEntry) -> (u64, ApplyOutcome) {
        let mut node = self.inner.lock().await;
        node.index += 1;
        node.clock += 1;
        let record = LogRecord {
            index: node.index,
            timestamp: node.clock,
            entry,
        };
        let index = node.index;
        let outcome = node.executor.apply(record).expect("single node log is gap-free");
        (index, outcome)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.executor.sessions().len()
    }
}

#[async_trait]
impl SessionTransport for SingleNode {
    async fn open_session(&self, req: OpenSessionRequest) -> Result<OpenSessionResponse> {
        let (index, outcome) = self
            .append(LogEntry::OpenSession {
                client_id: req.client_id,
                timeout: req.timeout,
            })
            .await;
        match outcome {
            ApplyOutcome::SessionOpened { session_id, timeout } => Ok(OpenSessionResponse {
                status: Status::Ok,
                index,
                session_id,
                timeout,
            }),
            other => bail!("unexpected outcome opening session: {:?}", other),
        }
    }

    async fn command(&self, req: CommandRequest) -> Result<CommandResponse> {
        let (index, outcome) = self
            .append(LogEntry::Command {
                session_id: req.session_id,
                sequence: req.sequence,
                operation: req.operation,
            })
            .await;
        match outcome {
            ApplyOutcome::Reply { result } => Ok(match result {
                Ok(bytes) => CommandResponse {
                    status: Status::Ok,
                    index,
                    result: bytes,
                },
                Err(kind) => CommandResponse {
                    status: Status::Error(kind),
                    index,
                    result: Bytes::new(),
                },
            }),
            other => bail!("unexpected outcome for command: {:?}", other),
        }
    }

    async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        let (index, outcome) = self
            .append(LogEntry::Query {
                session_id: req.session_id,
                operation: req.operation,
            })
            .await;
        match outcome {
            ApplyOutcome::Reply { result } => Ok(match result {
                Ok(bytes) => QueryResponse {
                    status: Status::Ok,
                    index,
                    result: bytes,
                },
                Err(kind) => QueryResponse {
                    status: Status::Error(kind),
                    index,
                    result: Bytes::new(),
                },
            }),
            other => bail!("unexpected outcome for query: {:?}", other),
        }
    }

    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<KeepAliveResponse> {
        let (index, outcome) = self
            .append(LogEntry::KeepAlive {
                session_id: req.session_id,
                command_sequence: req.command_sequence,
                event_index: req.event_index,
            })
            .await;
        match outcome {
            ApplyOutcome::KeptAlive { events } => Ok(KeepAliveResponse {
                status: Status::Ok,
                index,
                events,
            }),
            ApplyOutcome::Reply { result: Err(kind) } => Ok(KeepAliveResponse {
                status: Status::Error(kind),
                index,
                events: vec![],
            }),
            other => bail!("unexpected outcome for keep-alive: {:?}", other),
        }
    }

    async fn close_session(&self, req: CloseSessionRequest) -> Result<CloseSessionResponse> {
        let (index, outcome) = self
            .append(LogEntry::CloseSession {
                session_id: req.session_id,
            })
            .await;
        match outcome {
            ApplyOutcome::SessionClosed => Ok(CloseSessionResponse {
                status: Status::Ok,
                index,
            }),
            ApplyOutcome::Reply { result: Err(kind) } => Ok(CloseSessionResponse {
                status: Status::Error(kind),
                index,
            }),
            other => bail!("unexpected outcome closing session: {:?}", other),
        }
    }
}
