//! Brokerless RPC over ZeroMQ.
//!
//! Every host runs a receiver ([`ZmqProxy`]) that pulls messages from the
//! network and relays them per topic to local IPC sockets. In-process
//! consumers ([`Connection`]) attach to those sockets; callers
//! ([`ZmqTransport`], [`RpcProxy`]) resolve a topic to hosts through a
//! [`MatchMaker`] and push straight to each host's receiver.

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod matchmaker;
pub mod proxy;
pub mod reactor;
pub mod rpc;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use client::{CallOptions, RpcProxy};
pub use config::{MatchMakerConfig, MatchMakerDriver, RpcConfig, RpcTimeouts, ZmqConfig};
pub use dispatch::{Dispatcher, HandlerError, RemoteFailure};
pub use envelope::{Message, Reply, RpcContext};
pub use error::{Result, RpcError};
pub use matchmaker::{BindingKind, BindingTable, MatchMaker, QueueTarget};
pub use proxy::ZmqProxy;
pub use reactor::{ConsumerState, Registration, ZmqReactor};
pub use rpc::{Connection, ZmqTransport};
pub use socket::{SocketKind, ZmqSocket};
pub use transport::Endpoint;
