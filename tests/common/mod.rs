//! Shared fixtures: a receiver on a loopback port with its IPC directory
//! in a temp dir, and a recording dispatcher.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use topicwire::{
    Connection, Dispatcher, HandlerError, MatchMaker, QueueTarget, Reply, Result, RpcConfig,
    RpcContext, ZmqProxy, ZmqTransport,
};

pub const LOOPBACK: &str = "127.0.0.1";

/// Generous bound for anything crossing real sockets.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn config(dir: &TempDir, port: u16) -> RpcConfig {
    let mut config = RpcConfig::default();
    config.zmq.bind_address = LOOPBACK.to_string();
    config.zmq.port = port;
    config.zmq.host = LOOPBACK.to_string();
    config.zmq.ipc_dir = dir.path().join("ipc");
    config.rpc.response_timeout_secs = 10;
    config.rpc.cast_timeout_secs = 5;
    config
}

/// Every topic lives on the loopback receiver, named as asked.
pub struct Loopback;

#[async_trait]
impl MatchMaker for Loopback {
    async fn queues(&self, topic: &str) -> Result<Vec<QueueTarget>> {
        Ok(vec![QueueTarget::new(topic, LOOPBACK)])
    }
}

/// Nobody serves anything.
pub struct Nobody;

#[async_trait]
impl MatchMaker for Nobody {
    async fn queues(&self, _topic: &str) -> Result<Vec<QueueTarget>> {
        Ok(Vec::new())
    }
}

/// A running receiver plus a transport pointed at it.
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<ZmqTransport>,
    pub proxy: ZmqProxy,
}

impl Harness {
    pub fn start(matchmaker: Arc<dyn MatchMaker>) -> Self {
        Self::start_with(matchmaker, |_| {})
    }

    /// Start with `tweak` applied to the default test config.
    pub fn start_with(matchmaker: Arc<dyn MatchMaker>, tweak: impl FnOnce(&mut RpcConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir, free_port());
        tweak(&mut config);
        let transport = Arc::new(ZmqTransport::with_matchmaker(config, matchmaker));
        let proxy = ZmqProxy::new(&transport);
        proxy.consume_in_thread().unwrap();
        Self {
            dir,
            transport,
            proxy,
        }
    }

    pub async fn shutdown(self, connection: Connection) {
        connection.close().await;
        self.proxy.close().await;
        self.transport.cleanup().await;
    }
}

/// A message seen by a `Recorder`.
#[derive(Debug, Clone)]
pub struct Seen {
    pub worker: usize,
    pub method: String,
    pub args: Map<String, Value>,
}

/// Test service. One-way methods are reported on a channel; the others
/// answer the way their name says.
pub struct Recorder {
    worker: usize,
    seen: mpsc::UnboundedSender<Seen>,
}

impl Recorder {
    pub fn new(worker: usize, seen: mpsc::UnboundedSender<Seen>) -> Arc<Self> {
        Arc::new(Self { worker, seen })
    }
}

#[async_trait]
impl Dispatcher for Recorder {
    async fn dispatch(
        &self,
        ctx: &RpcContext,
        _version: Option<&str>,
        method: &str,
        args: Map<String, Value>,
    ) -> std::result::Result<Reply, HandlerError> {
        match method {
            "create" | "ping" | "publish" => {
                let _ = self.seen.send(Seen {
                    worker: self.worker,
                    method: method.to_string(),
                    args,
                });
                Ok(Reply::Empty)
            }
            "get" => Ok(Reply::Value(json!({"status": "ok"}))),
            "slow" => {
                let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Reply::Value(args.get("id").cloned().unwrap_or(Value::Null)))
            }
            "stream" => {
                for n in 1..=3 {
                    ctx.reply(json!(n));
                }
                Ok(Reply::Empty)
            }
            "fail" => Err(HandlerError::new("RuntimeError", "order store unavailable")
                .with_module("orders")
                .with_traceback(vec!["in fail".to_string()])),
            "crash" => panic!("order cache corrupted"),
            other => Err(HandlerError::unknown_method(other)),
        }
    }
}

pub fn msg(method: &str, args: Value) -> Value {
    json!({"method": method, "args": args})
}

/// Next message seen, or panic after `WAIT`.
pub async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("recorder channel closed")
}
