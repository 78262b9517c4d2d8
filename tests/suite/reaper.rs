//! Client directory sweeps after real connections end.

use std::time::Duration;

use kiln_types::ClientId;

use crate::common::{Fixture, connect, local_tcp, serve_one};

fn id(name: &str) -> ClientId {
    ClientId::new(name).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_within_delay_keeps_directory() {
    let fixture = Fixture::new(Duration::from_millis(300));

    let first = serve_one(&fixture, local_tcp(), 4).await;
    let mut client = connect(&first.address).await;
    client.initialize("metals").await;
    drop(client);
    let mut outcome = first.task.await.unwrap();
    assert!(!fixture.registry.contains(&id("metals")));

    // Same identity comes back before the sweep runs.
    let second = serve_one(&fixture, local_tcp(), 4).await;
    let mut client = connect(&second.address).await;
    client.initialize("metals").await;
    assert!(fixture.registry.contains(&id("metals")));

    let report = outcome.reaped().await.unwrap();
    assert!(report.deleted.is_empty(), "deleted {:?}", report.deleted);
    assert_eq!(report.retained, 1);
    assert!(fixture.client_dir("metals").is_dir());

    drop(client);
    second.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_deletes_disconnected_client_but_not_live_one() {
    let fixture = Fixture::new(Duration::from_millis(20));

    let a = serve_one(&fixture, local_tcp(), 4).await;
    let b = serve_one(&fixture, local_tcp(), 4).await;
    let mut client_a = connect(&a.address).await;
    let mut client_b = connect(&b.address).await;
    client_a.initialize("client-a").await;
    client_b.initialize("client-b").await;

    // Left behind by a server that crashed earlier.
    std::fs::create_dir_all(fixture.client_dir("ghost")).unwrap();

    drop(client_a);
    let mut outcome = a.task.await.unwrap();
    let report = outcome.reaped().await.unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec![id("client-a"), id("ghost")]);
    assert!(!fixture.client_dir("client-a").exists());
    assert!(fixture.client_dir("client-b").is_dir());
    assert!(report.failed.is_empty());

    drop(client_b);
    let mut outcome = b.task.await.unwrap();
    let report = outcome.reaped().await.unwrap();
    assert_eq!(report.deleted, vec![id("client-b")]);
}

#[tokio::test]
async fn connection_that_never_identified_still_sweeps() {
    let fixture = Fixture::new(Duration::from_millis(5));
    std::fs::create_dir_all(fixture.client_dir("orphan")).unwrap();

    let served = serve_one(&fixture, local_tcp(), 1).await;
    let client = connect(&served.address).await;
    drop(client);

    let mut outcome = served.task.await.unwrap();
    assert!(outcome.client().is_none());
    let report = outcome.reaped().await.unwrap();
    assert_eq!(report.deleted, vec![id("orphan")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_live_connection_cannot_claim_same_identity() {
    let fixture = Fixture::new(Duration::from_millis(10));

    let first = serve_one(&fixture, local_tcp(), 4).await;
    let second = serve_one(&fixture, local_tcp(), 4).await;
    let mut holder = connect(&first.address).await;
    let mut intruder = connect(&second.address).await;

    let accepted = holder.initialize("metals").await;
    assert!(accepted.get("error").is_none(), "{accepted}");
    let rejected = intruder.initialize("metals").await;
    assert!(rejected["error"]["message"]
        .as_str()
        .unwrap()
        .contains("already connected"));

    drop(intruder);
    let mut outcome = second.task.await.unwrap();
    assert!(outcome.client().is_none());
    let report = outcome.reaped().await.unwrap();
    assert!(report.deleted.is_empty(), "deleted {:?}", report.deleted);
    assert!(fixture.registry.contains(&id("metals")));
    assert!(fixture.client_dir("metals").is_dir());

    let ping = holder.request("test/sleep", serde_json::json!({"ms": 1})).await;
    assert_eq!(ping["result"]["ms"], 1);

    drop(holder);
    let mut outcome = first.task.await.unwrap();
    let report = outcome.reaped().await.unwrap();
    assert_eq!(report.deleted, vec![id("metals")]);
}
