//! Worker pool behaviour observed from a socket client.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use kiln_bsp::TeardownReason;
use kiln_bsp::protocol::codes;
use serde_json::json;

use crate::common::{Fixture, connect, eventually, local_tcp, serve_one};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_of_four_runs_at_most_four_and_completes_all_ten() {
    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 4).await;
    let mut client = connect(&served.address).await;

    let mut sent = BTreeSet::new();
    for i in 0..10 {
        sent.insert(client.send_request("test/sleep", json!({"ms": 50, "n": i})).await);
    }

    let mut answered = BTreeSet::new();
    for _ in 0..10 {
        let response = client.recv().await.unwrap();
        assert!(response.get("error").is_none(), "unexpected error: {response}");
        answered.insert(response["id"].as_i64().unwrap());
    }
    assert_eq!(answered, sent);

    let peak = fixture.probe.peak.load(Ordering::SeqCst);
    assert!((2..=4).contains(&peak), "peak concurrency was {peak}");
    assert_eq!(fixture.probe.completed.load(Ordering::SeqCst), 10);

    drop(client);
    let outcome = served.task.await.unwrap();
    assert_eq!(outcome.dispatch().dispatched, 10);
}

#[tokio::test]
async fn failing_frame_does_not_block_the_next_one() {
    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 1).await;
    let mut client = connect(&served.address).await;

    let failed = client.request("test/fail", json!({})).await;
    assert_eq!(failed["error"]["code"], codes::INTERNAL_ERROR);
    assert_eq!(failed["error"]["message"], "scripted failure");

    let next = client.request("test/sleep", json!({"ms": 1})).await;
    assert_eq!(next["result"]["ms"], 1);

    let unknown = client.request("buildTarget/compile", json!({})).await;
    assert_eq!(unknown["error"]["code"], codes::METHOD_NOT_FOUND);

    drop(client);
    let outcome = served.task.await.unwrap();
    assert_eq!(outcome.dispatch().handler_errors, 2);
    assert!(!outcome.pool_failed());
    assert_eq!(outcome.reason(), Some(TeardownReason::PumpFinished));
}

#[tokio::test]
async fn cancel_request_stops_only_its_target() {
    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 4).await;
    let mut client = connect(&served.address).await;

    let first = client.send_request("test/wait", json!({})).await;
    let second = client.send_request("test/wait", json!({})).await;
    let probe = &fixture.probe;
    assert!(eventually(|| probe.current.load(Ordering::SeqCst) == 2).await);

    client.cancel(first).await;
    let response = client.recv().await.unwrap();
    assert_eq!(response["id"], first);
    assert_eq!(response["error"]["code"], codes::REQUEST_CANCELLED);
    assert_eq!(probe.current.load(Ordering::SeqCst), 1);

    // Cancelling a finished request is a no-op.
    client.cancel(first).await;
    client.cancel(second).await;
    let response = client.recv().await.unwrap();
    assert_eq!(response["id"], second);
    assert_eq!(probe.cancelled.load(Ordering::SeqCst), 2);

    drop(client);
    let outcome = served.task.await.unwrap();
    assert_eq!(outcome.dispatch().cancelled_requests, 2);
    assert_eq!(outcome.dispatch().handler_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_every_in_flight_handler() {
    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 4).await;
    let mut client = connect(&served.address).await;

    for _ in 0..3 {
        client.send_request("test/wait", json!({})).await;
    }
    let probe = &fixture.probe;
    assert!(eventually(|| probe.current.load(Ordering::SeqCst) == 3).await);

    served.shutdown.cancel();
    served.shutdown.cancel();

    let outcome = served.task.await.unwrap();
    assert_eq!(outcome.reason(), Some(TeardownReason::Cancelled));
    assert_eq!(outcome.teardown_count(), 1);
    assert_eq!(outcome.dispatch().detached, 0);
    assert_eq!(probe.cancelled.load(Ordering::SeqCst), 3);
    assert_eq!(probe.current.load(Ordering::SeqCst), 0);
}
