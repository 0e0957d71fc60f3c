//! Consumers announced through the heartbeat directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::{msg, Harness, Recorder};
use topicwire::matchmaker::{InMemoryStore, RedisMatchMaker};
use topicwire::{MatchMaker, RpcContext};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registered_consumer_is_reachable_until_closed() {
    let directory = Arc::new(RedisMatchMaker::new(
        InMemoryStore::new(),
        Duration::from_secs(600),
        Duration::from_secs(300),
    ));
    let harness = Harness::start(directory.clone());
    let ctx = RpcContext::new();

    let (tx, _rx) = mpsc::unbounded_channel();
    let connection = harness.transport.create_connection();
    connection
        .create_consumer("orders", Recorder::new(0, tx), false)
        .await
        .unwrap();
    connection.consume_in_thread().await.unwrap();
    assert!(directory.heartbeat().is_running());

    let queues = directory.queues("orders").await.unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].name, "orders.127.0.0.1");

    let result = harness
        .transport
        .call(&ctx, "orders", &msg("get", json!({"id": 42})))
        .await
        .unwrap();
    assert_eq!(result, json!({"status": "ok"}));

    connection.close().await;
    assert!(!directory.heartbeat().is_running());
    assert!(directory.queues("orders").await.unwrap().is_empty());
    assert!(harness
        .transport
        .call(&ctx, "orders", &msg("get", json!({})))
        .await
        .unwrap_err()
        .is_timeout());

    harness.proxy.close().await;
    harness.transport.cleanup().await;
}
