//! Casts through a real receiver to local consumers.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use common::{msg, next_seen, Harness, Loopback, Recorder, LOOPBACK};
use topicwire::{MatchMaker, QueueTarget, Result, RpcContext};

/// Loopback, plus an unreachable peer once `dead_peer` is set.
#[derive(Default)]
struct WithDeadPeer {
    dead_peer: AtomicBool,
}

#[async_trait]
impl MatchMaker for WithDeadPeer {
    async fn queues(&self, topic: &str) -> Result<Vec<QueueTarget>> {
        let mut targets = Vec::new();
        if self.dead_peer.load(Ordering::SeqCst) {
            // nothing listens on this loopback address
            targets.push(QueueTarget::new(topic, "127.0.0.2"));
        }
        targets.push(QueueTarget::new(topic, LOOPBACK));
        Ok(targets)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cast_reaches_exactly_one_worker() {
    let harness = Harness::start(Arc::new(Loopback));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = harness.transport.create_connection();
    for worker in 0..2 {
        connection
            .create_consumer("orders", Recorder::new(worker, tx.clone()), false)
            .await
            .unwrap();
    }
    connection.consume_in_thread().await.unwrap();

    let ctx = RpcContext::new().with("user", "alice");
    harness
        .transport
        .cast(&ctx, "orders", &msg("create", json!({"id": 42})))
        .await
        .unwrap();

    let seen = next_seen(&mut rx).await;
    assert_eq!(seen.method, "create");
    assert_eq!(seen.args["id"], 42);
    assert!(seen.worker < 2);

    // the other worker gets nothing for this message
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    harness.shutdown(connection).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_work_queue_delivers_each_message_once() {
    let harness = Harness::start(Arc::new(Loopback));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = harness.transport.create_connection();
    for worker in 0..2 {
        connection
            .create_consumer("orders", Recorder::new(worker, tx.clone()), false)
            .await
            .unwrap();
    }
    connection.consume_in_thread().await.unwrap();

    let ctx = RpcContext::new();
    for id in 0..20 {
        harness
            .transport
            .cast(&ctx, "orders", &msg("create", json!({"id": id})))
            .await
            .unwrap();
    }

    let mut ids = HashSet::new();
    for _ in 0..20 {
        let seen = next_seen(&mut rx).await;
        assert!(ids.insert(seen.args["id"].as_i64().unwrap()), "delivered twice");
    }
    assert_eq!(ids.len(), 20);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    harness.shutdown(connection).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_host_qualified_cast_uses_base_topic() {
    let harness = Harness::start(Arc::new(Loopback));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = harness.transport.create_connection();
    connection
        .create_consumer("orders.anything", Recorder::new(0, tx), false)
        .await
        .unwrap();
    connection.consume_in_thread().await.unwrap();

    harness
        .transport
        .cast(&RpcContext::new(), "orders.host1", &msg("create", json!({"id": 7})))
        .await
        .unwrap();
    assert_eq!(next_seen(&mut rx).await.args["id"], 7);
    assert_eq!(harness.proxy.topics().await, vec!["orders"]);

    harness.shutdown(connection).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_reaches_every_worker() {
    let harness = Harness::start(Arc::new(Loopback));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = harness.transport.create_connection();
    for worker in 0..2 {
        connection
            .create_consumer("logs", Recorder::new(worker, tx.clone()), true)
            .await
            .unwrap();
    }
    connection.consume_in_thread().await.unwrap();
    let ctx = RpcContext::new();

    // subscribers attach asynchronously; ping until both answer
    let mut ready = HashSet::new();
    let started = std::time::Instant::now();
    while ready.len() < 2 {
        assert!(started.elapsed() < common::WAIT, "fanout subscribers never attached");
        harness
            .transport
            .fanout_cast(&ctx, "logs", &msg("ping", json!({})))
            .await
            .unwrap();
        if let Ok(Some(seen)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            ready.insert(seen.worker);
        }
    }

    harness
        .transport
        .fanout_cast(&ctx, "logs", &msg("publish", json!({"line": "disk full"})))
        .await
        .unwrap();

    let mut workers = HashSet::new();
    while workers.len() < 2 {
        let seen = next_seen(&mut rx).await;
        if seen.method == "publish" {
            assert_eq!(seen.args["line"], "disk full");
            assert!(workers.insert(seen.worker), "broadcast delivered twice");
        }
    }

    harness.shutdown(connection).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fanout_survives_unreachable_peer() {
    let matchmaker = Arc::new(WithDeadPeer::default());
    let harness = Harness::start_with(matchmaker.clone(), |config| {
        config.rpc.cast_timeout_secs = 1;
    });
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = harness.transport.create_connection();
    connection
        .create_consumer("logs", Recorder::new(0, tx), true)
        .await
        .unwrap();
    connection.consume_in_thread().await.unwrap();
    let ctx = RpcContext::new();

    let started = std::time::Instant::now();
    loop {
        assert!(started.elapsed() < common::WAIT, "fanout subscriber never attached");
        harness
            .transport
            .fanout_cast(&ctx, "logs", &msg("ping", json!({})))
            .await
            .unwrap();
        if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            break;
        }
    }

    matchmaker.dead_peer.store(true, Ordering::SeqCst);
    harness
        .transport
        .fanout_cast(&ctx, "logs", &msg("publish", json!({"line": "disk full"})))
        .await
        .unwrap();

    let seen = loop {
        let seen = next_seen(&mut rx).await;
        if seen.method == "publish" {
            break seen;
        }
    };
    assert_eq!(seen.args["line"], "disk full");

    // the unreachable peer still fails on its own
    assert!(harness
        .transport
        .cast(&ctx, "logs", &msg("create", json!({})))
        .await
        .is_err());

    harness.shutdown(connection).await;
}
