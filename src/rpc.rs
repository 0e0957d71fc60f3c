//! Request/reply over ZeroMQ.
//!
//! `ZmqTransport` is the process-wide runtime context: it owns the lazily
//! created ZeroMQ context, the matchmaker and the outbound socket cache, and
//! implements `cast`, `call`, `multicall`, `fanout_cast` and `notify`.
//!
//! A call is a cast of a `-reply` wrapper. The receiver runs the wrapped
//! message and casts a `-process_reply` back to `zmq_replies.<caller host>`,
//! with the call's message id as the first frame. The caller waits on a
//! short-lived SUB socket attached to its local reply relay and filtered by
//! that id:
//!
//! ```text
//! caller                     receiver host                 caller host
//!   │ PUSH [id, svc.h, -reply] ─► proxy ─► svc consumer
//!   │                                          │ PUSH [id, zmq_replies.c, -process_reply]
//!   │                                          └──────────► proxy ─► PUB zmq_replies
//!   └──────────────────── SUB (filter = id) ◄──────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::{MatchMakerDriver, RpcConfig};
use crate::dispatch::{Dispatcher, RemoteFailure};
use crate::envelope::{Frames, InternalReply, Message, RpcContext, NO_REPLY_ID};
use crate::error::{Result, RpcError};
use crate::matchmaker::{ring_matchmaker, BindingTable, MatchMaker, QueueTarget, RedisMatchMaker, Ring};
use crate::reactor::{ZmqReactor, Registration};
use crate::socket::{SocketKind, ZmqSocket};
use crate::transport::{self, Endpoint, FANOUT_PREFIX, REPLY_TOPIC};

/// Host used for targets the matchmaker returns without one.
const DEFAULT_TARGET_HOST: &str = "localhost";

/// Unique message ids for outstanding calls.
///
/// A random base fixed at construction plus a process-wide counter, so ids
/// never repeat within a process and are unlikely to collide across
/// processes. Ids have a fixed width and never prefix each other, which the
/// reply subscription filter relies on.
#[derive(Debug)]
pub struct MessageIdGenerator {
    base: u64,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            base: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}{:016x}", self.base, n)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

type SharedSocket = Arc<tokio::sync::Mutex<ZmqSocket>>;

/// Runtime context shared by every component of a process.
pub struct ZmqTransport {
    config: RpcConfig,
    context: Mutex<Option<Arc<zmq::Context>>>,
    matchmaker: tokio::sync::Mutex<Option<Arc<dyn MatchMaker>>>,
    /// Replaces the configured driver when set
    injected: Option<Arc<dyn MatchMaker>>,
    /// Outbound PUSH sockets by address
    sockets: Mutex<HashMap<String, SharedSocket>>,
    ids: MessageIdGenerator,
}

impl ZmqTransport {
    /// Transport using the matchmaker driver named in `config`.
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            context: Mutex::new(None),
            matchmaker: tokio::sync::Mutex::new(None),
            injected: None,
            sockets: Mutex::new(HashMap::new()),
            ids: MessageIdGenerator::new(),
        }
    }

    /// Transport resolving topics through `matchmaker`.
    pub fn with_matchmaker(config: RpcConfig, matchmaker: Arc<dyn MatchMaker>) -> Self {
        Self {
            injected: Some(matchmaker),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// The shared ZeroMQ context, created on first use.
    pub fn context(&self) -> Arc<zmq::Context> {
        let mut guard = self.context.lock();
        if let Some(context) = guard.as_ref() {
            return Arc::clone(context);
        }
        let context = zmq::Context::new();
        if let Err(e) = context.set_io_threads(self.config.zmq.io_threads) {
            warn!(error = %e, io_threads = self.config.zmq.io_threads, "cannot set zmq io threads");
        }
        let context = Arc::new(context);
        *guard = Some(Arc::clone(&context));
        debug!("created zmq context");
        context
    }

    /// The matchmaker, built from the configured driver on first use.
    pub async fn matchmaker(&self) -> Result<Arc<dyn MatchMaker>> {
        let mut guard = self.matchmaker.lock().await;
        if let Some(matchmaker) = guard.as_ref() {
            return Ok(Arc::clone(matchmaker));
        }
        let matchmaker = match &self.injected {
            Some(matchmaker) => Arc::clone(matchmaker),
            None => self.build_matchmaker().await?,
        };
        *guard = Some(Arc::clone(&matchmaker));
        Ok(matchmaker)
    }

    /// The matchmaker if one is currently loaded; never builds one.
    pub async fn loaded_matchmaker(&self) -> Option<Arc<dyn MatchMaker>> {
        self.matchmaker.lock().await.clone()
    }

    async fn build_matchmaker(&self) -> Result<Arc<dyn MatchMaker>> {
        let config = &self.config.matchmaker;
        let matchmaker: Arc<dyn MatchMaker> = match config.driver {
            MatchMakerDriver::Localhost => Arc::new(BindingTable::localhost(self.config.zmq.host.clone())),
            MatchMakerDriver::Stub => Arc::new(BindingTable::stub()),
            MatchMakerDriver::Ring => Arc::new(ring_matchmaker(Ring::load(&config.ringfile)?)),
            MatchMakerDriver::Redis => Arc::new(RedisMatchMaker::connect(config).await?),
        };
        info!(driver = ?config.driver, "matchmaker ready");
        Ok(matchmaker)
    }

    /// Release the context, matchmaker and cached sockets.
    ///
    /// Later use recreates them. Calling it twice is a no-op.
    pub async fn cleanup(&self) {
        if let Some(matchmaker) = self.matchmaker.lock().await.take() {
            matchmaker.stop_heartbeat();
        }
        let sockets: Vec<SharedSocket> = self.sockets.lock().drain().map(|(_, socket)| socket).collect();
        let context = self.context.lock().take();
        if sockets.is_empty() && context.is_none() {
            return;
        }
        // terminating the context waits for lingering sends
        let released = tokio::task::spawn_blocking(move || {
            drop(sockets);
            drop(context);
        })
        .await;
        if let Err(e) = released {
            error!(error = %e, "zmq cleanup failed");
        }
        info!("transport cleaned up");
    }

    /// Topic this host receives replies on.
    pub fn reply_topic(&self) -> String {
        format!("{}.{}", REPLY_TOPIC, self.config.zmq.host)
    }

    /// Local IPC endpoint of `topic`'s relay socket.
    pub fn topic_endpoint(&self, topic: &str) -> Endpoint {
        transport::topic_endpoint(&self.config.zmq.ipc_dir, topic)
    }

    /// Network ingress of `host`.
    pub fn host_endpoint(&self, host: &str) -> Endpoint {
        Endpoint::tcp(host, self.config.zmq.port)
    }

    fn target_endpoint(&self, target: &QueueTarget) -> Endpoint {
        self.host_endpoint(target.host.as_deref().unwrap_or(DEFAULT_TARGET_HOST))
    }

    /// Live targets for `topic`. Nobody listening is a delivery failure.
    pub async fn resolve(&self, topic: &str) -> Result<Vec<QueueTarget>> {
        let queues = self.matchmaker().await?.queues(topic).await?;
        if queues.is_empty() {
            warn!(topic = %topic, "no matchmaker results");
            return Err(RpcError::Timeout("No match from matchmaker.".to_string()));
        }
        debug!(topic = %topic, queues = queues.len(), "resolved topic");
        Ok(queues)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Casts
    // ─────────────────────────────────────────────────────────────────────

    /// Send `msg` to every target of `topic` without waiting for a reply.
    pub async fn cast(&self, ctx: &RpcContext, topic: &str, msg: &Value) -> Result<()> {
        self.cast_with_timeout(ctx, topic, msg, self.config.rpc.cast_timeout())
            .await
    }

    pub async fn cast_with_timeout(
        &self,
        ctx: &RpcContext,
        topic: &str,
        msg: &Value,
        timeout: Duration,
    ) -> Result<()> {
        self.multi_cast(ctx, topic, msg, timeout, false).await
    }

    /// Send `msg` to every live consumer of `topic`.
    ///
    /// Failing targets are logged and skipped.
    pub async fn fanout_cast(&self, ctx: &RpcContext, topic: &str, msg: &Value) -> Result<()> {
        let topic = format!("{}{}", FANOUT_PREFIX, topic);
        self.multi_cast(ctx, &topic, msg, self.config.rpc.cast_timeout(), true)
            .await
    }

    /// Cast a notification. Dots in `topic` become dashes so a priority
    /// suffix is not taken for a host.
    pub async fn notify(&self, ctx: &RpcContext, topic: &str, msg: &Value) -> Result<()> {
        let topic = topic.replace('.', "-");
        self.cast(ctx, &topic, msg).await
    }

    async fn multi_cast(
        &self,
        ctx: &RpcContext,
        topic: &str,
        msg: &Value,
        timeout: Duration,
        best_effort: bool,
    ) -> Result<()> {
        let queues = self.resolve(topic).await?;
        let envelope = codec::serialize_msg(msg)?;

        let sends = queues.iter().map(|target| {
            let address = self.target_endpoint(target);
            let envelope = &envelope;
            async move {
                let result = self
                    .cast_to(&address, ctx, &target.name, envelope, NO_REPLY_ID, timeout)
                    .await;
                (target, result)
            }
        });

        let mut first_error = None;
        for (target, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                error!(topic = %target.name, error = %e, "cast failed");
                if !best_effort && first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Send one enveloped message to `address`, bounded by `timeout`.
    pub async fn cast_to(
        &self,
        address: &Endpoint,
        ctx: &RpcContext,
        topic: &str,
        envelope: &Value,
        msg_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let frames = Frames::encode(msg_id, topic, ctx, envelope)?;
        match tokio::time::timeout(timeout, self.push_once(address, frames)).await {
            Ok(result) => result,
            Err(_) => {
                self.evict_socket(address);
                Err(RpcError::Timeout(format!(
                    "Timeout while sending cast to {}",
                    address
                )))
            }
        }
    }

    async fn push_once(&self, address: &Endpoint, frames: Frames) -> Result<()> {
        let socket = self.outbound_socket(address)?;
        let result = socket.lock().await.send(frames.into_multipart()).await;
        match &result {
            Ok(()) => debug!(address = %address, "sent message"),
            Err(_) => self.evict_socket(address),
        }
        result
    }

    fn outbound_socket(&self, address: &Endpoint) -> Result<SharedSocket> {
        let key = address.zmq_endpoint();
        if let Some(socket) = self.sockets.lock().get(&key) {
            return Ok(Arc::clone(socket));
        }
        let context = self.context();
        let mut sockets = self.sockets.lock();
        if let Some(socket) = sockets.get(&key) {
            return Ok(Arc::clone(socket));
        }
        let socket = ZmqSocket::open(&context, address, SocketKind::Push, false, &[] as &[&[u8]])?;
        let socket = Arc::new(tokio::sync::Mutex::new(socket));
        sockets.insert(key, Arc::clone(&socket));
        Ok(socket)
    }

    fn evict_socket(&self, address: &Endpoint) {
        if self.sockets.lock().remove(&address.zmq_endpoint()).is_some() {
            debug!(address = %address, "evicted outbound socket");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────

    /// Call `topic` and return the last reply value.
    pub async fn call(&self, ctx: &RpcContext, topic: &str, msg: &Value) -> Result<Value> {
        self.call_with_timeout(ctx, topic, msg, self.config.rpc.response_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        ctx: &RpcContext,
        topic: &str,
        msg: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let mut response = self.multicall_with_timeout(ctx, topic, msg, timeout).await?;
        Ok(response.pop().unwrap_or(Value::Null))
    }

    /// Call `topic` and return every reply value in order.
    pub async fn multicall(&self, ctx: &RpcContext, topic: &str, msg: &Value) -> Result<Vec<Value>> {
        self.multicall_with_timeout(ctx, topic, msg, self.config.rpc.response_timeout())
            .await
    }

    pub async fn multicall_with_timeout(
        &self,
        ctx: &RpcContext,
        topic: &str,
        msg: &Value,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let queues = self.resolve(topic).await?;
        // a call goes to a single consumer
        let target = &queues[0];
        let address = self.target_endpoint(target);
        self.call_at(&address, ctx, &target.name, msg, timeout).await
    }

    /// Send a wrapped call to `address` and wait for its reply.
    ///
    /// The reply subscriber is closed on every exit path.
    pub async fn call_at(
        &self,
        address: &Endpoint,
        ctx: &RpcContext,
        topic: &str,
        msg: &Value,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let msg_id = self.ids.next_id();
        let wrapped = Message::Reply(InternalReply {
            msg_id: msg_id.clone(),
            reply_topic: self.reply_topic(),
            context: ctx.marshal()?,
            request: msg.clone(),
        });
        let envelope = codec::serialize_msg(&wrapped.encode())?;
        let frames = Frames::encode(&msg_id, topic, ctx, &envelope)?;

        let mut waiter = ZmqSocket::open(
            &self.context(),
            &self.topic_endpoint(REPLY_TOPIC),
            SocketKind::Sub,
            false,
            &[msg_id.as_bytes()],
        )?;
        debug!(msg_id = %msg_id, topic = %topic, address = %address, "sending call");

        let outcome = tokio::time::timeout(timeout, async {
            self.push_once(address, frames).await?;
            await_reply(&mut waiter, &msg_id).await
        })
        .await;
        waiter.close();

        let response = match outcome {
            Ok(response) => response?,
            Err(_) => {
                return Err(RpcError::Timeout(format!(
                    "Timeout while waiting on RPC response - msg_id {}",
                    msg_id
                )))
            }
        };
        decode_response(response)
    }

    /// Cast a handler's response back to the caller's reply topic.
    pub(crate) async fn send_reply(
        &self,
        ctx: &RpcContext,
        reply_topic: &str,
        msg_id: &str,
        response: Vec<Value>,
    ) -> Result<()> {
        let reply = Message::ProcessReply {
            msg_id: msg_id.to_string(),
            response,
        };
        let envelope = codec::serialize_msg(&reply.encode())?;
        let host = reply_topic
            .split_once('.')
            .map(|(_, host)| host)
            .unwrap_or(DEFAULT_TARGET_HOST);
        self.cast_to(
            &self.host_endpoint(host),
            ctx,
            reply_topic,
            &envelope,
            msg_id,
            self.config.rpc.cast_timeout(),
        )
        .await
    }

    /// Consumer connection sharing this transport.
    pub fn create_connection(self: &Arc<Self>) -> Connection {
        Connection::new(Arc::clone(self))
    }
}

async fn await_reply(waiter: &mut ZmqSocket, msg_id: &str) -> Result<Vec<Value>> {
    loop {
        let frames = Frames::from_multipart(waiter.recv().await?)?;
        if frames.msg_id != msg_id {
            continue;
        }
        let (_, raw) = frames.decode_body()?;
        match Message::decode(&codec::deserialize_msg(&raw)?)? {
            Message::ProcessReply { msg_id: id, response } if id == msg_id => {
                debug!(msg_id = %msg_id, values = response.len(), "received reply");
                return Ok(response);
            }
            _ => warn!(msg_id = %msg_id, "unexpected message on reply socket"),
        }
    }
}

/// Raise the first remote failure in `response`, otherwise return it.
pub fn decode_response(response: Vec<Value>) -> Result<Vec<Value>> {
    for value in &response {
        if let Some(failure) = RemoteFailure::from_reply_value(value) {
            return Err(failure?.into_error());
        }
    }
    Ok(response)
}

/// Consumers of one process attached to their local topic relays.
pub struct Connection {
    transport: Arc<ZmqTransport>,
    reactor: ZmqReactor,
    topics: Mutex<Vec<String>>,
}

impl Connection {
    pub fn new(transport: Arc<ZmqTransport>) -> Self {
        Self {
            reactor: ZmqReactor::new(Arc::clone(&transport)),
            transport,
            topics: Mutex::new(Vec::new()),
        }
    }

    /// Consume `topic` with `dispatcher`.
    ///
    /// Only the base topic is consumed; host-qualified messages reach it
    /// through the relay. A fanout consumer sees every broadcast, a plain
    /// one competes with the other consumers of the topic.
    pub async fn create_consumer(
        &self,
        topic: &str,
        dispatcher: Arc<dyn Dispatcher>,
        fanout: bool,
    ) -> Result<()> {
        let topic = transport::base_topic(topic);
        let registration = if fanout {
            let endpoint = self
                .transport
                .topic_endpoint(&format!("{}{}", FANOUT_PREFIX, topic));
            Registration::new(endpoint, SocketKind::Sub).connect().subscribe("")
        } else {
            Registration::new(self.transport.topic_endpoint(topic), SocketKind::Pull).connect()
        };
        self.reactor.register(dispatcher, registration)?;

        let host = &self.transport.config().zmq.host;
        self.transport.matchmaker().await?.register(topic, host).await?;
        self.topics.lock().push(topic.to_string());
        info!(topic = %topic, fanout, "created consumer");
        Ok(())
    }

    /// Start consuming, and heartbeating when anything was registered.
    pub async fn consume_in_thread(&self) -> Result<()> {
        if !self.topics.lock().is_empty() {
            self.transport.matchmaker().await?.start_heartbeat()?;
        }
        self.reactor.consume_in_thread();
        Ok(())
    }

    pub async fn wait(&self) {
        self.reactor.wait().await;
    }

    /// Withdraw from the matchmaker and stop every consumer.
    pub async fn close(&self) {
        let topics: Vec<String> = self.topics.lock().drain(..).collect();
        // after cleanup there is nothing left to withdraw from
        match self.transport.loaded_matchmaker().await {
            Some(matchmaker) => {
                matchmaker.stop_heartbeat();
                let host = &self.transport.config().zmq.host;
                for topic in &topics {
                    if let Err(e) = matchmaker.unregister(topic, host).await {
                        warn!(topic = %topic, error = %e, "failed to unregister consumer");
                    }
                }
            }
            None if !topics.is_empty() => {
                debug!(topics = topics.len(), "matchmaker already released, skipping unregister")
            }
            None => {}
        }
        self.reactor.close().await;
    }

    pub fn reactor(&self) -> &ZmqReactor {
        &self.reactor
    }
}
