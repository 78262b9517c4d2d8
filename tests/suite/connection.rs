//! End-to-end connection lifecycle over real sockets.

use std::time::{Duration, Instant};

use kiln_bsp::{Endpoint, PumpExit, TeardownReason};
use kiln_types::ClientId;
use serde_json::json;

use crate::common::{Fixture, connect, local_tcp, serve_one};

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abrupt_disconnect_over_domain_socket_tears_down_once_then_reaps() {
    let fixture = Fixture::new(Duration::from_millis(100));
    let served = serve_one(
        &fixture,
        Endpoint::Unix {
            path: fixture.socket_path(),
        },
        4,
    )
    .await;

    let mut client = crate::common::connect_unix(&fixture.socket_path()).await;
    let response = client.initialize("metals").await;
    assert_eq!(response["result"]["displayName"], "kiln-test");
    assert!(fixture.client_dir("metals").is_dir());

    // No build/exit: the client just goes away.
    let dropped_at = Instant::now();
    drop(client);

    let mut outcome = served.task.await.unwrap();
    assert_eq!(outcome.reason(), Some(TeardownReason::PumpFinished));
    assert_eq!(outcome.pump_exit(), &PumpExit::Eof);
    assert_eq!(outcome.teardown_count(), 1);
    assert_eq!(outcome.client(), Some(&ClientId::new("metals").unwrap()));
    assert!(fixture.registry.is_empty());

    let report = outcome.reaped().await.unwrap();
    assert!(dropped_at.elapsed() >= Duration::from_millis(100));
    assert_eq!(report.deleted, vec![ClientId::new("metals").unwrap()]);
    assert!(!fixture.client_dir("metals").exists());
    assert!(!fixture.socket_path().exists());
}

#[tokio::test]
async fn exit_notification_closes_transport() {
    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 4).await;

    let mut client = connect(&served.address).await;
    client.initialize("bloop-cli").await;
    client.notify("build/exit", json!(null)).await;

    assert!(client.recv().await.is_none());
    let outcome = served.task.await.unwrap();
    assert_eq!(outcome.reason(), Some(TeardownReason::ExitRequested));
    assert_eq!(outcome.pump_exit(), &PumpExit::Stopped);
    assert_eq!(outcome.teardown_count(), 1);
}

#[tokio::test]
async fn malformed_frame_is_treated_like_eof() {
    use tokio::io::AsyncWriteExt;

    let fixture = Fixture::new(Duration::from_millis(10));
    let served = serve_one(&fixture, local_tcp(), 2).await;

    let kiln_bsp::BoundAddress::Tcp(addr) = served.address else {
        panic!("expected tcp");
    };
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"Content-Length: 9\r\n\r\nnot json!")
        .await
        .unwrap();

    let outcome = served.task.await.unwrap();
    assert!(matches!(outcome.pump_exit(), PumpExit::Failed(_)));
    assert_eq!(outcome.reason(), Some(TeardownReason::PumpFinished));
    assert_eq!(outcome.teardown_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_exit_disconnect_and_shutdown_tear_down_once() {
    for _ in 0..20 {
        let fixture = Fixture::new(Duration::from_millis(1));
        let served = serve_one(&fixture, local_tcp(), 4).await;

        let mut client = connect(&served.address).await;
        client.initialize("racer").await;
        client.notify("build/exit", json!(null)).await;
        served.shutdown.cancel();
        drop(client);

        let outcome = served.task.await.unwrap();
        assert_eq!(outcome.teardown_count(), 1);
        assert!(outcome.reason().is_some());
        assert!(fixture.registry.is_empty());
    }
}
