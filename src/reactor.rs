//! Reactor: consumer loops over registered sockets.
//!
//! Each registered inbound socket gets one task that receives messages and
//! either relays them to a paired outbound socket or hands them to a
//! `Consume` implementation. `ZmqReactor` decodes and dispatches to
//! application code through a bounded pool; the topic relay in
//! [`crate::proxy`] reuses the same loop.
//!
//! # Lifecycle
//!
//! ```text
//! register() ─► consume_in_thread() ─► Idle ⇄ Receiving ⇄ Dispatching
//!                                           └──── close() ───► Closed
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::dispatch::{Dispatcher, HandlerError, RemoteFailure};
use crate::envelope::{Frames, InternalReply, Message, Reply, RpcContext};
use crate::error::{Result, RpcError};
use crate::rpc::ZmqTransport;
use crate::socket::{SocketKind, ZmqSocket};
use crate::transport::Endpoint;

/// Sockets to open for one consumer.
#[derive(Debug, Clone)]
pub struct Registration {
    in_endpoint: Endpoint,
    in_kind: SocketKind,
    in_bind: bool,
    subscriptions: Vec<Vec<u8>>,
    out: Option<(Endpoint, SocketKind, bool)>,
}

impl Registration {
    /// Inbound socket of `kind`, bound by default.
    pub fn new(endpoint: Endpoint, kind: SocketKind) -> Self {
        Self {
            in_endpoint: endpoint,
            in_kind: kind,
            in_bind: true,
            subscriptions: Vec::new(),
            out: None,
        }
    }

    /// Connect the inbound socket instead of binding it.
    pub fn connect(mut self) -> Self {
        self.in_bind = false;
        self
    }

    pub fn subscribe(mut self, filter: impl Into<Vec<u8>>) -> Self {
        self.subscriptions.push(filter.into());
        self
    }

    /// Forward every inbound message to an outbound socket.
    pub fn relay_to(mut self, endpoint: Endpoint, kind: SocketKind, bind: bool) -> Self {
        self.out = Some((endpoint, kind, bind));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.in_kind.can_recv() {
            return Err(RpcError::Configuration(format!(
                "bad input socket type {}",
                self.in_kind
            )));
        }
        if let Some((_, kind, _)) = &self.out {
            if !kind.can_send() {
                return Err(RpcError::Configuration(format!(
                    "bad output socket type {}",
                    kind
                )));
            }
        }
        if !self.subscriptions.is_empty() && self.in_kind != SocketKind::Sub {
            return Err(RpcError::Configuration(format!(
                "subscriptions on {} socket",
                self.in_kind
            )));
        }
        Ok(())
    }
}

/// Where a consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Receiving,
    Dispatching,
    Closed,
}

/// Handles messages received on a socket without a paired outbound.
#[async_trait]
pub trait Consume: Send + Sync + 'static {
    async fn consume(&self, frames: Vec<Vec<u8>>, dispatcher: Option<&Arc<dyn Dispatcher>>);

    /// Wait for work the consumer spawned on its own. Called once the
    /// consumer loops have stopped.
    async fn drain(&self) {}
}

struct Consumer {
    inbound: ZmqSocket,
    outbound: Option<ZmqSocket>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    state: Arc<Mutex<ConsumerState>>,
}

impl Consumer {
    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }
}

/// Registration bookkeeping and consumer tasks shared by reactor flavours.
pub struct BaseReactor<C: Consume> {
    context: Arc<zmq::Context>,
    consume: Arc<C>,
    pending: Mutex<Vec<Consumer>>,
    states: Mutex<Vec<(String, Arc<Mutex<ConsumerState>>)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl<C: Consume> BaseReactor<C> {
    pub fn new(context: Arc<zmq::Context>, consume: Arc<C>, shutdown: CancellationToken) -> Self {
        Self {
            context,
            consume,
            pending: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Open the registration's sockets. After `consume_in_thread` the new
    /// consumer starts immediately.
    pub fn register(
        &self,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        registration: Registration,
    ) -> Result<()> {
        registration.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Configuration("reactor is closed".to_string()));
        }

        let inbound = ZmqSocket::open(
            &self.context,
            &registration.in_endpoint,
            registration.in_kind,
            registration.in_bind,
            &registration.subscriptions,
        )?;
        let outbound = match &registration.out {
            Some((endpoint, kind, bind)) => Some(ZmqSocket::open(
                &self.context,
                endpoint,
                *kind,
                *bind,
                &[] as &[&[u8]],
            )?),
            None => None,
        };

        info!(
            address = %inbound.address(),
            kind = %inbound.kind(),
            relay = ?outbound.as_ref().map(|s| s.address().to_string()),
            "registered consumer socket"
        );

        let state = Arc::new(Mutex::new(ConsumerState::Idle));
        self.states
            .lock()
            .push((inbound.address().to_string(), Arc::clone(&state)));
        let consumer = Consumer {
            inbound,
            outbound,
            dispatcher,
            state,
        };

        if self.started.load(Ordering::SeqCst) {
            self.spawn(consumer);
        } else {
            self.pending.lock().push(consumer);
        }
        Ok(())
    }

    /// Start one consumer task per registered inbound socket.
    pub fn consume_in_thread(&self) {
        self.started.store(true, Ordering::SeqCst);
        let pending: Vec<Consumer> = self.pending.lock().drain(..).collect();
        for consumer in pending {
            self.spawn(consumer);
        }
    }

    fn spawn(&self, consumer: Consumer) {
        let handle = tokio::spawn(run_consumer(
            Arc::clone(&self.consume),
            consumer,
            self.shutdown.clone(),
        ));
        self.workers.lock().push(handle);
    }

    /// Wait for every consumer task to finish.
    pub async fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "consumer task failed");
                }
            }
        }
    }

    /// Stop consuming, close every socket and wait for the tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        // never-started consumers close their sockets on drop
        self.pending.lock().clear();
        self.wait().await;
        self.consume.drain().await;
        for (_, state) in self.states.lock().iter() {
            *state.lock() = ConsumerState::Closed;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Inbound address and state of each registered consumer.
    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.states
            .lock()
            .iter()
            .map(|(address, state)| (address.clone(), *state.lock()))
            .collect()
    }

    pub fn consumer(&self) -> &Arc<C> {
        &self.consume
    }
}

async fn run_consumer<C: Consume>(consume: Arc<C>, mut consumer: Consumer, shutdown: CancellationToken) {
    debug!(address = %consumer.inbound.address(), "consumer loop started");
    loop {
        consumer.set_state(ConsumerState::Receiving);
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = consumer.inbound.recv() => received,
        };
        let frames = match received {
            Ok(frames) => frames,
            Err(e) => {
                error!(address = %consumer.inbound.address(), error = %e, "receive failed, stopping consumer");
                break;
            }
        };

        consumer.set_state(ConsumerState::Dispatching);
        match consumer.outbound.as_mut() {
            Some(outbound) => {
                debug!(from = %consumer.inbound.address(), to = %outbound.address(), "relaying message");
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    sent = outbound.send(frames) => sent,
                };
                if let Err(e) = sent {
                    error!(address = %outbound.address(), error = %e, "relay send failed");
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = consume.consume(frames, consumer.dispatcher.as_ref()) => {}
                }
            }
        }
        consumer.set_state(ConsumerState::Idle);
    }

    consumer.inbound.close();
    if let Some(outbound) = consumer.outbound.as_mut() {
        outbound.close();
    }
    consumer.set_state(ConsumerState::Closed);
    debug!(address = %consumer.inbound.address(), "consumer loop stopped");
}

/// Decodes messages and runs them on the dispatch pool.
pub struct DispatchConsumer {
    transport: Arc<ZmqTransport>,
    pool: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Consume for DispatchConsumer {
    async fn consume(&self, frames: Vec<Vec<u8>>, dispatcher: Option<&Arc<dyn Dispatcher>>) {
        let Some(dispatcher) = dispatcher else {
            error!("no dispatcher for consumer socket, dropping message");
            return;
        };
        let (ctx, request) = match decode_request(frames) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(error = %e, "dropping undecodable message");
                return;
            }
        };

        // a full pool holds up receiving, not the handlers already running
        let Ok(permit) = Arc::clone(&self.pool).acquire_owned().await else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let dispatcher = Arc::clone(dispatcher);
        let shutdown = self.shutdown.clone();
        let task = async move {
            let _permit = permit;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = process(&transport, dispatcher.as_ref(), ctx, request) => {}
            }
        };
        let mut tasks = self.tasks.lock();
        // reap finished handlers so the set only holds live ones
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "dispatch task failed");
                }
            }
        }
    }
}

fn decode_request(frames: Vec<Vec<u8>>) -> Result<(RpcContext, Value)> {
    let frames = Frames::from_multipart(frames)?;
    let (marshaled, raw) = frames.decode_body()?;
    let request = codec::deserialize_msg(&raw)?;
    let ctx = RpcContext::unmarshal(&marshaled)?;
    debug!(topic = %frames.topic, msg_id = %frames.msg_id, "received message");
    Ok((ctx, request))
}

/// Run one decoded message against `dispatcher`.
pub async fn process(
    transport: &ZmqTransport,
    dispatcher: &dyn Dispatcher,
    ctx: RpcContext,
    request: Value,
) {
    match Message::decode(&request) {
        Err(e) => error!(error = %e, "RPC message did not include method"),
        Ok(Message::Application(call)) => {
            if let Err(e) =
                guarded_dispatch(dispatcher, &ctx, call.version.as_deref(), &call.method, call.args).await
            {
                log_handler_error(&call.method, &e);
            }
        }
        Ok(Message::Reply(reply)) => {
            let response = reply_response(dispatcher, &ctx, &reply).await;
            if let Err(e) = transport
                .send_reply(&ctx, &reply.reply_topic, &reply.msg_id, response)
                .await
            {
                error!(
                    msg_id = %reply.msg_id,
                    topic = %reply.reply_topic,
                    error = %e,
                    "failed to send reply"
                );
            }
        }
        Ok(Message::ProcessReply { msg_id, .. }) => {
            warn!(msg_id = %msg_id, "reply arrived on a consumer socket, dropping");
        }
    }
}

async fn reply_response(
    dispatcher: &dyn Dispatcher,
    ctx: &RpcContext,
    reply: &InternalReply,
) -> Vec<Value> {
    let call = match Message::decode(&reply.request) {
        Ok(Message::Application(call)) => call,
        Ok(_) => {
            let err = HandlerError::expected("EnvelopeError", "wrapped message is not an application call");
            return vec![failure_value(&err)];
        }
        Err(e) => {
            let err = HandlerError::expected("EnvelopeError", e.to_string());
            return vec![failure_value(&err)];
        }
    };

    match guarded_dispatch(dispatcher, ctx, call.version.as_deref(), &call.method, call.args).await {
        Ok(result) => result.normalize(ctx.take_replies()),
        Err(e) => {
            log_handler_error(&call.method, &e);
            vec![failure_value(&e)]
        }
    }
}

/// Dispatch with a panicking handler reported as a `Panic` failure.
async fn guarded_dispatch(
    dispatcher: &dyn Dispatcher,
    ctx: &RpcContext,
    version: Option<&str>,
    method: &str,
    args: Map<String, Value>,
) -> std::result::Result<Reply, HandlerError> {
    AssertUnwindSafe(dispatcher.dispatch(ctx, version, method, args))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(HandlerError::new("Panic", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn failure_value(err: &HandlerError) -> Value {
    RemoteFailure::from(err)
        .to_reply_value()
        .unwrap_or(Value::Null)
}

fn log_handler_error(method: &str, err: &HandlerError) {
    if err.expected {
        debug!(method = %method, error = %err, "expected exception during message handling");
    } else {
        error!(
            method = %method,
            error = %err,
            traceback = %err.traceback.join("\n"),
            "exception during message handling"
        );
    }
}

/// Reactor dispatching to application `Dispatcher`s.
pub struct ZmqReactor {
    base: BaseReactor<DispatchConsumer>,
}

impl ZmqReactor {
    pub fn new(transport: Arc<ZmqTransport>) -> Self {
        let shutdown = CancellationToken::new();
        let pool = Arc::new(Semaphore::new(transport.config().rpc.thread_pool_size));
        let context = transport.context();
        let consumer = Arc::new(DispatchConsumer {
            transport,
            pool,
            tasks: Mutex::new(JoinSet::new()),
            shutdown: shutdown.clone(),
        });
        Self {
            base: BaseReactor::new(context, consumer, shutdown),
        }
    }

    pub fn register(&self, dispatcher: Arc<dyn Dispatcher>, registration: Registration) -> Result<()> {
        self.base.register(Some(dispatcher), registration)
    }

    pub fn consume_in_thread(&self) {
        self.base.consume_in_thread();
    }

    pub async fn wait(&self) {
        self.base.wait().await;
    }

    pub async fn close(&self) {
        self.base.close().await;
    }

    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.base.states()
    }
}
