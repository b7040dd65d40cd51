use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::time::sleep;

use raft_session::message::Operation;
use raft_session::message::OperationId;
use raft_session::SessionClient;

mod fixtures;

const APPEND: OperationId = OperationId(1);

/// Out-of-order command responses test (client ordering invariant).
///
/// What does this test do?
///
/// - submits two commands against a hand-driven transport.
/// - completes the second command's response (index=10) before the first
///   (index=9).
/// - asserts that neither user future resolves until the first response
///   arrives, that both then resolve in submission order with the correct
///   payloads, and that the session counters advance to
///   `command_response=2` / `response_index=10`.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn out_of_order_command_responses() -> Result<()> {
    fixtures::init_tracing();

    let transport = fixtures::ManualTransport::new();
    let client = SessionClient::connect(transport.clone(), fixtures::test_config()).await?;

    tracing::info!("--- submitting two commands");

    let c1 = client.clone();
    let h1 = tokio::spawn(async move { c1.submit(Operation::command(APPEND, &b"first"[..])).await });
    let first = transport.next_command().await;
    assert_eq!(first.request.sequence, 1);

    let c2 = client.clone();
    let h2 = tokio::spawn(async move { c2.submit(Operation::command(APPEND, &b"second"[..])).await });
    let second = transport.next_command().await;
    assert_eq!(second.request.sequence, 2);

    tracing::info!("--- completing the second response first");

    second.complete(10, &b"Hello world again!"[..]);
    sleep(Duration::from_millis(100)).await;
    assert!(!h1.is_finished(), "first future must not resolve before its response");
    assert!(!h2.is_finished(), "second future must wait for the first response");

    tracing::info!("--- completing the first response");

    first.complete(9, &b"Hello world!"[..]);
    assert_eq!(h1.await??, Bytes::from_static(b"Hello world!"));
    assert_eq!(h2.await??, Bytes::from_static(b"Hello world again!"));

    let metrics = client
        .wait(Some(Duration::from_secs(1)))
        .command_response(2, "both responses delivered")
        .await?;
    assert_eq!(metrics.response_index, 10);

    client.close().await?;
    Ok(())
}

/// Buffered responses drain head-of-line, in sequence order, no matter how
/// the transport interleaves completions.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn responses_drain_in_sequence_order() -> Result<()> {
    fixtures::init_tracing();

    let transport = fixtures::ManualTransport::new();
    let client = SessionClient::connect(transport.clone(), fixtures::test_config()).await?;

    let mut handles = Vec::new();
    let mut captured = Vec::new();
    for i in 0..3u64 {
        let c = client.clone();
        let payload = format!("payload-{}", i).into_bytes();
        handles.push(tokio::spawn(async move { c.submit(Operation::command(APPEND, payload)).await }));
        captured.push(transport.next_command().await);
    }
    let c3 = captured.pop().expect("third command");
    let c2 = captured.pop().expect("second command");
    let c1 = captured.pop().expect("first command");

    tracing::info!("--- completing responses 3, 1, 2");

    c3.complete(13, &b"three"[..]);
    c1.complete(11, &b"one"[..]);

    // 1 is head-of-line and resolves; 3 stays parked behind the missing 2.
    let h1 = handles.remove(0);
    assert_eq!(h1.await??, Bytes::from_static(b"one"));
    sleep(Duration::from_millis(100)).await;
    assert!(!handles[1].is_finished(), "third future must wait for the second");

    c2.complete(12, &b"two"[..]);
    let h2 = handles.remove(0);
    let h3 = handles.remove(0);
    assert_eq!(h2.await??, Bytes::from_static(b"two"));
    assert_eq!(h3.await??, Bytes::from_static(b"three"));

    let metrics = client
        .wait(Some(Duration::from_secs(1)))
        .command_response(3, "all responses delivered")
        .await?;
    assert_eq!(metrics.response_index, 13);

    client.close().await?;
    Ok(())
}
