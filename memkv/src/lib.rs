//! An in-memory versioned map state machine for the `raft-session` executor.
//!
//! This is primarily used for testing the session runtime, the same way an
//! in-memory store backs a Raft engine's own test suite. Values carry the
//! commit index of the write that produced them as their version, and TTLs
//! are realized as operations scheduled in logical time, so expiry is
//! deterministic on every replica and survives snapshot/restore.

use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use raft_session::message::Operation;
use raft_session::message::OperationId;
use raft_session::message::OperationKind;
use raft_session::server::CloseReason;
use raft_session::server::Commit;
use raft_session::server::OperationContext;
use raft_session::server::SnapshotService;
use raft_session::server::StateMachineExecutor;
use raft_session::SessionId;

/// Store a value under a key.
pub const PUT: OperationId = OperationId(10);
/// Store a value under a key and expire it after a TTL in logical time.
pub const PUT_WITH_TTL: OperationId = OperationId(11);
/// Read the versioned value under a key.
pub const GET: OperationId = OperationId(12);
/// Remove a key, returning its previous value.
pub const REMOVE: OperationId = OperationId(13);
/// Internal: fired by the scheduler when a TTL elapses.
pub const EXPIRE: OperationId = OperationId(14);

/// A request against the key/value service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvRequest {
    Put { key: String, value: Vec<u8> },
    PutWithTtl { key: String, value: Vec<u8>, ttl: u64 },
    Get { key: String },
    Remove { key: String },
    /// Internal TTL expiry; removes the key only if it has not been
    /// overwritten since the write that scheduled it.
    Expire { key: String, version: u64 },
}

impl KvRequest {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        KvRequest::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn put_with_ttl(key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: u64) -> Self {
        KvRequest::PutWithTtl {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        KvRequest::Get { key: key.into() }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        KvRequest::Remove { key: key.into() }
    }

    /// Encode this request as the operation the service expects.
    pub fn to_operation(&self) -> Result<Operation> {
        let payload = serde_json::to_vec(self).context("encoding key/value request")?;
        let operation = match self {
            KvRequest::Get { .. } => Operation::query(GET, payload),
            KvRequest::Put { .. } => Operation::command(PUT, payload),
            KvRequest::PutWithTtl { .. } => Operation::command(PUT_WITH_TTL, payload),
            KvRequest::Remove { .. } => Operation::command(REMOVE, payload),
            KvRequest::Expire { .. } => Operation::command(EXPIRE, payload),
        };
        Ok(operation)
    }
}

/// The response to a `KvRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvResponse {
    /// The value under the requested key, if any.
    Value(Option<VersionedValue>),
    /// The write was applied.
    Done,
}

impl KvResponse {
    /// Decode a response from reply bytes.
    pub fn decode(payload: &[u8]) -> Result<KvResponse> {
        serde_json::from_slice(payload).context("decoding key/value response")
    }
}

/// A stored value and the commit index of the write that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// The in-memory map backing the service.
#[derive(Clone, Debug, Default)]
pub struct MemKv {
    entries: BTreeMap<String, VersionedValue>,
}

impl MemKv {
    /// Build an executor around a fresh store with every key/value operation
    /// registered.
    pub fn executor() -> StateMachineExecutor<MemKv> {
        let mut executor = StateMachineExecutor::new(MemKv::default());
        executor.register(PUT, OperationKind::Command, Box::new(apply_put));
        executor.register(PUT_WITH_TTL, OperationKind::Command, Box::new(apply_put_with_ttl));
        executor.register(GET, OperationKind::Query, Box::new(apply_get));
        executor.register(REMOVE, OperationKind::Command, Box::new(apply_remove));
        executor.register(EXPIRE, OperationKind::Command, Box::new(apply_expire));
        executor.on_session_close(Box::new(log_session_close));
        executor
    }

    /// Direct read access, for assertions.
    pub fn get(&self, key: &str) -> Option<&VersionedValue> {
        self.entries.get(key)
    }

    /// The full map, for whole-state assertions.
    pub fn entries(&self) -> &BTreeMap<String, VersionedValue> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SnapshotService for MemKv {
    fn snapshot(&self, w: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(w, &self.entries).context("serializing key/value state")?;
        Ok(())
    }

    fn install(&mut self, r: &mut dyn Read) -> Result<()> {
        self.entries = serde_json::from_reader(r).context("deserializing key/value state")?;
        Ok(())
    }
}

// The map holds no session-scoped state; nothing to release on close.
fn log_session_close(_kv: &mut MemKv, session: SessionId, reason: CloseReason) {
    tracing::debug!(session, ?reason, "session closed");
}

fn decode(payload: &Bytes) -> Result<KvRequest> {
    serde_json::from_slice(payload).context("decoding key/value request")
}

fn encode(response: &KvResponse) -> Result<Bytes> {
    let body = serde_json::to_vec(response).context("encoding key/value response")?;
    Ok(Bytes::from(body))
}

fn apply_put(kv: &mut MemKv, _ctx: &mut OperationContext<'_>, commit: Commit) -> Result<Bytes> {
    match decode(commit.value())? {
        KvRequest::Put { key, value } => {
            kv.entries.insert(key, VersionedValue {
                value,
                version: commit.index(),
            });
            encode(&KvResponse::Done)
        }
        other => bail!("unexpected request for PUT: {:?}", other),
    }
}

fn apply_put_with_ttl(kv: &mut MemKv, ctx: &mut OperationContext<'_>, commit: Commit) -> Result<Bytes> {
    match decode(commit.value())? {
        KvRequest::PutWithTtl { key, value, ttl } => {
            kv.entries.insert(key.clone(), VersionedValue {
                value,
                version: commit.index(),
            });
            let expire = KvRequest::Expire {
                key,
                version: commit.index(),
            };
            ctx.schedule(ttl, expire.to_operation()?)?;
            encode(&KvResponse::Done)
        }
        other => bail!("unexpected request for PUT_WITH_TTL: {:?}", other),
    }
}

fn apply_get(kv: &mut MemKv, _ctx: &mut OperationContext<'_>, commit: Commit) -> Result<Bytes> {
    match decode(commit.value())? {
        KvRequest::Get { key } => encode(&KvResponse::Value(kv.entries.get(&key).cloned())),
        other => bail!("unexpected request for GET: {:?}", other),
    }
}

fn apply_remove(kv: &mut MemKv, _ctx: &mut OperationContext<'_>, commit: Commit) -> Result<Bytes> {
    match decode(commit.value())? {
        KvRequest::Remove { key } => encode(&KvResponse::Value(kv.entries.remove(&key))),
        other => bail!("unexpected request for REMOVE: {:?}", other),
    }
}

fn apply_expire(kv: &mut MemKv, _ctx: &mut OperationContext<'_>, commit: Commit) -> Result<Bytes> {
    match decode(commit.value())? {
        KvRequest::Expire { key, version } => {
            let current = kv.entries.get(&key).map(|v| v.version);
            if current == Some(version) {
                tracing::debug!(%key, version, "ttl elapsed; removing key");
                kv.entries.remove(&key);
            }
            encode(&KvResponse::Done)
        }
        other => bail!("unexpected request for EXPIRE: {:?}", other),
    }
}
