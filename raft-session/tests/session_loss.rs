use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use pretty_assertions::assert_eq;

use raft_session::error::ErrorKind;
use raft_session::error::SubmitError;
use raft_session::message::Operation;
use raft_session::message::OperationId;
use raft_session::SessionClient;
use raft_session::SessionState;

mod fixtures;

const APPEND: OperationId = OperationId(1);

/// Unknown session terminates all pending work.
///
/// What does this test do?
///
/// - submits two commands.
/// - completes the first response with `UnknownSession`.
/// - asserts that both pending futures fail, the session flips to `Expired`,
///   and a later submit fails immediately without touching the transport.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn unknown_session_fails_all_pending() -> Result<()> {
    fixtures::init_tracing();

    let transport = fixtures::ManualTransport::new();
    let client = SessionClient::connect(transport.clone(), fixtures::test_config()).await?;
    let session_id = client.session_id();

    let c1 = client.clone();
    let h1 = tokio::spawn(async move { c1.submit(Operation::command(APPEND, &b"first"[..])).await });
    let first = transport.next_command().await;

    let c2 = client.clone();
    let h2 = tokio::spawn(async move { c2.submit(Operation::command(APPEND, &b"second"[..])).await });
    let _second = transport.next_command().await;

    tracing::info!("--- failing the first command with UnknownSession");

    first.fail(0, ErrorKind::UnknownSession(session_id));

    assert_eq!(h1.await?, Err(SubmitError::UnknownSession(session_id)));
    assert_eq!(h2.await?, Err(SubmitError::UnknownSession(session_id)));

    client
        .wait(Some(Duration::from_secs(1)))
        .state(SessionState::Expired, "session lost")
        .await?;

    tracing::info!("--- submitting after session loss");

    let res = client.submit(Operation::command(APPEND, &b"third"[..])).await;
    assert_eq!(res, Err(SubmitError::SessionExpired));

    client.close().await?;
    Ok(())
}

/// Transport-level failures are retried with the same sequence number until
/// a terminal response arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn command_retries_on_transport_error() -> Result<()> {
    fixtures::init_tracing();

    let transport = fixtures::ManualTransport::new();
    let client = SessionClient::connect(transport.clone(), fixtures::test_config()).await?;

    let c = client.clone();
    let handle = tokio::spawn(async move { c.submit(Operation::command(APPEND, &b"retry me"[..])).await });

    let first_attempt = transport.next_command().await;
    assert_eq!(first_attempt.request.sequence, 1);
    tracing::info!("--- dropping the first attempt at the transport level");
    first_attempt.fail_transport("connection closed");

    let second_attempt = transport.next_command().await;
    assert_eq!(second_attempt.request.sequence, 1, "retry must reuse the sequence number");
    second_attempt.complete(3, &b"applied"[..]);

    assert_eq!(handle.await??, Bytes::from_static(b"applied"));

    client.close().await?;
    Ok(())
}
