//! Socket wrapper over tmq/ZMQ pipeline and pub/sub sockets.
//!
//! `ZmqSocket` owns one socket of a fixed `SocketKind`. Kinds that can only
//! send refuse to receive and vice versa; subscriptions only exist on SUB.
//!
//! # Example
//!
//! ```ignore
//! let ctx = zmq::Context::new();
//! let ep = Endpoint::parse("ipc:///tmp/tw/zmq_topic_orders")?;
//! let mut sub = ZmqSocket::open(&ctx, &ep, SocketKind::Sub, false, &[b"abc"])?;
//! let frames = sub.recv().await?;
//! ```

use std::fmt;

use futures::{SinkExt, StreamExt};
use tmq::Multipart;
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::transport::Endpoint;

/// Milliseconds a closed socket keeps trying to flush queued frames.
pub const LINGER_MS: i32 = 2_000;

/// ZMQ socket types used by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// PUSH socket (pipeline push)
    Push,
    /// PULL socket (pipeline pull)
    Pull,
    /// PUB socket (publish)
    Pub,
    /// SUB socket (subscribe)
    Sub,
}

impl SocketKind {
    pub fn can_send(&self) -> bool {
        matches!(self, SocketKind::Push | SocketKind::Pub)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self, SocketKind::Pull | SocketKind::Sub)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketKind::Push => "PUSH",
            SocketKind::Pull => "PULL",
            SocketKind::Pub => "PUB",
            SocketKind::Sub => "SUB",
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SocketKind> for zmq::SocketType {
    fn from(kind: SocketKind) -> Self {
        match kind {
            SocketKind::Push => zmq::SocketType::PUSH,
            SocketKind::Pull => zmq::SocketType::PULL,
            SocketKind::Pub => zmq::SocketType::PUB,
            SocketKind::Sub => zmq::SocketType::SUB,
        }
    }
}

impl TryFrom<zmq::SocketType> for SocketKind {
    type Error = RpcError;

    fn try_from(socket_type: zmq::SocketType) -> Result<Self> {
        match socket_type {
            zmq::SocketType::PUSH => Ok(SocketKind::Push),
            zmq::SocketType::PULL => Ok(SocketKind::Pull),
            zmq::SocketType::PUB => Ok(SocketKind::Pub),
            zmq::SocketType::SUB => Ok(SocketKind::Sub),
            other => Err(RpcError::Configuration(format!(
                "unsupported socket type: {:?}",
                other
            ))),
        }
    }
}

enum Inner {
    Push(tmq::push::Push),
    Pull(tmq::pull::Pull),
    Pub(tmq::publish::Publish),
    /// SUB before its first filter
    SubPending(tmq::subscribe::SubscribeWithoutTopic),
    Sub(tmq::subscribe::Subscribe),
}

/// One bound or connected socket.
pub struct ZmqSocket {
    address: String,
    kind: SocketKind,
    bound: bool,
    /// None once closed
    inner: Option<Inner>,
    subscriptions: Vec<Vec<u8>>,
}

impl ZmqSocket {
    /// Bind or connect a socket of `kind` and apply initial subscriptions.
    ///
    /// Subscriptions are only accepted for `SocketKind::Sub`.
    pub fn open<S: AsRef<[u8]>>(
        context: &zmq::Context,
        endpoint: &Endpoint,
        kind: SocketKind,
        bind: bool,
        subscribe: &[S],
    ) -> Result<Self> {
        if kind != SocketKind::Sub && !subscribe.is_empty() {
            return Err(RpcError::Capability(format!(
                "cannot subscribe on {} socket",
                kind
            )));
        }

        let address = endpoint.zmq_endpoint();
        if bind {
            endpoint.prepare_bind()?;
        }

        let socket_err = |e: tmq::TmqError| RpcError::socket(address.clone(), e);

        let inner = match kind {
            SocketKind::Push => {
                // a connecting sender only queues once the peer is reachable
                let builder = tmq::push(context)
                    .set_linger(LINGER_MS)
                    .set_immediate(!bind);
                Inner::Push(if bind {
                    builder.bind(&address)
                } else {
                    builder.connect(&address)
                }
                .map_err(socket_err)?)
            }
            SocketKind::Pull => {
                let builder = tmq::pull(context).set_linger(0);
                Inner::Pull(if bind {
                    builder.bind(&address)
                } else {
                    builder.connect(&address)
                }
                .map_err(socket_err)?)
            }
            SocketKind::Pub => {
                let builder = tmq::publish(context).set_linger(LINGER_MS);
                Inner::Pub(if bind {
                    builder.bind(&address)
                } else {
                    builder.connect(&address)
                }
                .map_err(socket_err)?)
            }
            SocketKind::Sub => {
                let builder = tmq::subscribe(context).set_linger(0);
                Inner::SubPending(if bind {
                    builder.bind(&address)
                } else {
                    builder.connect(&address)
                }
                .map_err(socket_err)?)
            }
        };

        info!(
            address = %address,
            kind = %kind,
            mode = if bind { "bind" } else { "connect" },
            "socket opened"
        );

        let mut socket = Self {
            address,
            kind,
            bound: bind,
            inner: Some(inner),
            subscriptions: Vec::new(),
        };
        for filter in subscribe {
            socket.subscribe(filter.as_ref())?;
        }
        Ok(socket)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Active subscription filters, in the order they were added.
    pub fn subscriptions(&self) -> &[Vec<u8>] {
        &self.subscriptions
    }

    /// Add a prefix filter. Subscribing twice to the same filter is a no-op.
    pub fn subscribe(&mut self, filter: &[u8]) -> Result<()> {
        self.require_sub("subscribe")?;
        if self.subscriptions.iter().any(|s| s == filter) {
            return Ok(());
        }

        let inner = self.inner.take().ok_or_else(|| self.closed_error())?;
        let subscribed = match inner {
            Inner::SubPending(socket) => socket.subscribe(filter),
            Inner::Sub(mut socket) => socket.subscribe(filter).map(|_| socket),
            other => {
                self.inner = Some(other);
                return Err(self.capability_error("subscribe"));
            }
        };

        match subscribed {
            Ok(socket) => {
                self.inner = Some(Inner::Sub(socket));
                self.subscriptions.push(filter.to_vec());
                debug!(address = %self.address, filter = %String::from_utf8_lossy(filter), "subscribed");
                Ok(())
            }
            // tmq consumes the socket on a failed first subscribe
            Err(e) => Err(RpcError::socket(self.address.clone(), e)),
        }
    }

    /// Remove a prefix filter. Unknown filters are a no-op.
    pub fn unsubscribe(&mut self, filter: &[u8]) -> Result<()> {
        self.require_sub("unsubscribe")?;
        let Some(position) = self.subscriptions.iter().position(|s| s == filter) else {
            return Ok(());
        };

        match self.inner.as_mut() {
            Some(Inner::Sub(socket)) => {
                socket
                    .unsubscribe(filter)
                    .map_err(|e| RpcError::socket(self.address.clone(), e))?;
            }
            Some(_) => return Err(self.capability_error("unsubscribe")),
            None => return Err(self.closed_error()),
        }

        self.subscriptions.remove(position);
        debug!(address = %self.address, filter = %String::from_utf8_lossy(filter), "unsubscribed");
        Ok(())
    }

    /// Send one multi-frame message.
    pub async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        if !self.kind.can_send() {
            return Err(self.capability_error("send"));
        }
        let message = Multipart::from(frames);
        let result = match self.inner.as_mut() {
            Some(Inner::Push(socket)) => socket.send(message).await,
            Some(Inner::Pub(socket)) => socket.send(message).await,
            Some(_) => return Err(self.capability_error("send")),
            None => return Err(self.closed_error()),
        };
        result.map_err(|e| RpcError::socket(self.address.clone(), e))
    }

    /// Wait for the next complete multi-frame message.
    ///
    /// A SUB socket without any filter never receives anything, so this
    /// pends until the caller gives up.
    pub async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        if !self.kind.can_recv() {
            return Err(self.capability_error("receive"));
        }
        let next = match self.inner.as_mut() {
            Some(Inner::Pull(socket)) => socket.next().await,
            Some(Inner::Sub(socket)) => socket.next().await,
            Some(Inner::SubPending(_)) => std::future::pending().await,
            Some(_) => return Err(self.capability_error("receive")),
            None => return Err(self.closed_error()),
        };

        match next {
            Some(Ok(multipart)) => Ok(multipart.into_iter().map(|frame| frame.to_vec()).collect()),
            Some(Err(e)) => Err(RpcError::socket(self.address.clone(), e)),
            None => Err(RpcError::socket(self.address.clone(), "socket stream ended")),
        }
    }

    /// Drop subscriptions and release the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        if let Inner::Sub(socket) = &mut inner {
            for filter in self.subscriptions.drain(..) {
                if let Err(e) = socket.unsubscribe(&filter) {
                    warn!(address = %self.address, error = %e, "unsubscribe during close failed");
                }
            }
        }
        self.subscriptions.clear();
        drop(inner);
        debug!(address = %self.address, kind = %self.kind, "socket closed");
    }

    fn require_sub(&self, operation: &str) -> Result<()> {
        if self.kind == SocketKind::Sub {
            Ok(())
        } else {
            Err(self.capability_error(operation))
        }
    }

    fn capability_error(&self, operation: &str) -> RpcError {
        RpcError::Capability(format!(
            "cannot {} on {} socket {}",
            operation, self.kind, self.address
        ))
    }

    fn closed_error(&self) -> RpcError {
        RpcError::socket(self.address.clone(), "socket is closed")
    }
}

impl Drop for ZmqSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ZmqSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZmqSocket")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("bound", &self.bound)
            .field("closed", &self.is_closed())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
