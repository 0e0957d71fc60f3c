//! Local topic relay.
//!
//! The proxy is the externally reachable ingress of a host. It pulls every
//! inbound message from one network socket and demultiplexes it by base
//! topic onto local IPC sockets that in-process consumers connect to:
//!
//! ```text
//! tcp://*:9501 (PULL) ─► orders      ─► ipc://<dir>/zmq_topic_orders        (PUSH)
//!                     ─► fanout~logs ─► ipc://<dir>/zmq_topic_fanout~logs   (PUB)
//!                     ─► zmq_replies ─► ipc://<dir>/zmq_topic_zmq_replies   (PUB)
//! ```
//!
//! Each topic has its own queue and drain task. A full queue drops the
//! message instead of stalling the ingress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ZmqConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::reactor::{BaseReactor, Consume, ConsumerState, Registration};
use crate::rpc::ZmqTransport;
use crate::socket::{SocketKind, ZmqSocket};
use crate::transport::{self, Endpoint};

/// Pause after binding a PUB socket so subscribers can attach first.
pub const PUB_SETTLE_DELAY: Duration = Duration::from_millis(500);

type RawMessage = Vec<Vec<u8>>;

/// Outcome of `TopicQueue::enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Backlog full; the message is gone
    Dropped,
    /// Drain task has stopped
    Closed,
}

enum QueueSender {
    Bounded(mpsc::Sender<RawMessage>),
    Unbounded(mpsc::UnboundedSender<RawMessage>),
}

/// Receiving half drained into the topic socket.
pub enum QueueReceiver {
    Bounded(mpsc::Receiver<RawMessage>),
    Unbounded(mpsc::UnboundedReceiver<RawMessage>),
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<RawMessage> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<RawMessage> {
        match self {
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// FIFO of raw messages for one topic.
pub struct TopicQueue {
    topic: String,
    sender: QueueSender,
    dropped: AtomicU64,
}

impl TopicQueue {
    /// Create a queue holding at most `capacity` messages, or unbounded.
    pub fn channel(topic: impl Into<String>, capacity: Option<usize>) -> (Self, QueueReceiver) {
        let (sender, receiver) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        let queue = Self {
            topic: topic.into(),
            sender,
            dropped: AtomicU64::new(0),
        };
        (queue, receiver)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Add a message without waiting. Never blocks the producer.
    pub fn enqueue(&self, message: RawMessage) -> Enqueue {
        let result = match &self.sender {
            QueueSender::Bounded(tx) => match tx.try_send(message) {
                Ok(()) => Enqueue::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
            },
            QueueSender::Unbounded(tx) => match tx.send(message) {
                Ok(()) => Enqueue::Queued,
                Err(_) => Enqueue::Closed,
            },
        };

        match result {
            Enqueue::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %self.topic,
                    "Local per-topic backlog buffer full for topic {}. Dropping message.",
                    self.topic
                );
            }
            Enqueue::Closed => {
                error!(topic = %self.topic, "topic relay stopped, dropping message");
            }
            Enqueue::Queued => {}
        }
        result
    }

    /// Messages dropped because the backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Demultiplexes inbound messages onto per-topic local sockets.
pub struct TopicRelay {
    context: Arc<zmq::Context>,
    ipc_dir: PathBuf,
    backlog: Option<usize>,
    queues: tokio::sync::Mutex<HashMap<String, Arc<TopicQueue>>>,
    drains: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TopicRelay {
    fn new(context: Arc<zmq::Context>, config: &ZmqConfig, shutdown: CancellationToken) -> Self {
        Self {
            context,
            ipc_dir: config.ipc_dir.clone(),
            backlog: config.topic_backlog,
            queues: tokio::sync::Mutex::new(HashMap::new()),
            drains: parking_lot::Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Queue for `topic`, creating its socket and drain task on first use.
    async fn queue_for(&self, topic: &str) -> Result<Arc<TopicQueue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(topic) {
            return Ok(Arc::clone(queue));
        }

        let kind = if transport::is_broadcast_topic(topic) {
            SocketKind::Pub
        } else {
            SocketKind::Push
        };
        let endpoint = transport::topic_endpoint(&self.ipc_dir, topic);
        let socket = ZmqSocket::open(&self.context, &endpoint, kind, true, &[] as &[&[u8]])?;

        let (queue, receiver) = TopicQueue::channel(topic, self.backlog);
        let queue = Arc::new(queue);
        let handle = tokio::spawn(drain_topic(
            topic.to_string(),
            socket,
            receiver,
            self.shutdown.clone(),
        ));
        self.drains.lock().push(handle);

        if kind == SocketKind::Pub {
            tokio::time::sleep(PUB_SETTLE_DELAY).await;
        }

        queues.insert(topic.to_string(), Arc::clone(&queue));
        info!(topic = %topic, address = %endpoint, kind = %kind, "created topic relay");
        Ok(queue)
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn dropped(&self, topic: &str) -> Option<u64> {
        self.queues.lock().await.get(topic).map(|queue| queue.dropped())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let drains: Vec<JoinHandle<()>> = self.drains.lock().drain(..).collect();
        futures::future::join_all(drains).await;
        self.queues.lock().await.clear();
    }
}

#[async_trait]
impl Consume for TopicRelay {
    async fn consume(&self, frames: Vec<Vec<u8>>, _dispatcher: Option<&Arc<dyn Dispatcher>>) {
        let topic = match frames.get(1).map(|topic| std::str::from_utf8(topic)) {
            Some(Ok(topic)) if frames.len() == 4 => transport::base_topic(topic).to_string(),
            _ => {
                error!(frames = frames.len(), "dropping malformed message");
                return;
            }
        };

        match self.queue_for(&topic).await {
            Ok(queue) => {
                if queue.enqueue(frames) == Enqueue::Queued {
                    debug!(topic = %topic, "queued message");
                }
            }
            Err(e) => error!(topic = %topic, error = %e, "cannot create topic socket"),
        }
    }
}

async fn drain_topic(
    topic: String,
    mut socket: ZmqSocket,
    mut receiver: QueueReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = socket.send(message) => sent,
        };
        match sent {
            Ok(()) => debug!(topic = %topic, "delivered message locally"),
            Err(e) => error!(topic = %topic, error = %e, "local delivery failed"),
        }
    }
    socket.close();
    debug!(topic = %topic, "topic relay stopped");
}

/// Host ingress relaying network traffic to local topic sockets.
pub struct ZmqProxy {
    config: ZmqConfig,
    relay: Arc<TopicRelay>,
    base: BaseReactor<TopicRelay>,
}

impl ZmqProxy {
    pub fn new(transport: &ZmqTransport) -> Self {
        let config = transport.config().zmq.clone();
        let context = transport.context();
        let shutdown = CancellationToken::new();
        let relay = Arc::new(TopicRelay::new(Arc::clone(&context), &config, shutdown.clone()));
        Self {
            base: BaseReactor::new(context, Arc::clone(&relay), shutdown),
            config,
            relay,
        }
    }

    /// Add another inbound socket feeding the relay.
    pub fn register(&self, registration: Registration) -> Result<()> {
        self.base.register(None, registration)
    }

    /// Bind the network ingress and start relaying.
    pub fn consume_in_thread(&self) -> Result<()> {
        transport::ensure_ipc_dir(&self.config.ipc_dir)?;
        let ingress = self.ingress_endpoint();
        self.register(Registration::new(ingress.clone(), SocketKind::Pull))?;
        self.base.consume_in_thread();
        info!(address = %ingress, ipc_dir = %self.config.ipc_dir.display(), "proxy consuming");
        Ok(())
    }

    pub fn ingress_endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.config.bind_address.clone(), self.config.port)
    }

    /// Base topics with a local socket, sorted.
    pub async fn topics(&self) -> Vec<String> {
        self.relay.topics().await
    }

    pub async fn dropped(&self, topic: &str) -> Option<u64> {
        self.relay.dropped(topic).await
    }

    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.base.states()
    }

    pub async fn wait(&self) {
        self.base.wait().await;
    }

    pub async fn close(&self) {
        self.base.close().await;
        self.relay.close().await;
        info!("proxy closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn frames(n: u8) -> RawMessage {
        vec![vec![n], b"orders".to_vec(), b"cast".to_vec(), b"[]".to_vec()]
    }

    #[traced_test]
    #[test]
    fn test_full_backlog_drops_newest() {
        let (queue, mut receiver) = TopicQueue::channel("orders", Some(3));
        for n in 0..3 {
            assert_eq!(queue.enqueue(frames(n)), Enqueue::Queued);
        }
        assert_eq!(queue.enqueue(frames(3)), Enqueue::Dropped);
        assert_eq!(queue.dropped(), 1);
        assert!(logs_contain("ERROR"));
        assert!(logs_contain("backlog buffer full for topic orders"));

        for n in 0..3 {
            assert_eq!(receiver.try_recv().unwrap(), frames(n));
        }
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_unbounded_never_drops() {
        let (queue, mut receiver) = TopicQueue::channel("orders", None);
        for n in 0..200 {
            assert_eq!(queue.enqueue(frames(n)), Enqueue::Queued);
        }
        assert_eq!(queue.dropped(), 0);
        assert_eq!(receiver.try_recv().unwrap(), frames(0));
    }

    #[test]
    fn test_closed_queue() {
        let (queue, receiver) = TopicQueue::channel("orders", Some(1));
        drop(receiver);
        assert_eq!(queue.enqueue(frames(0)), Enqueue::Closed);
        assert_eq!(queue.dropped(), 0);
    }
}
