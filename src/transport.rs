//! Endpoint addressing for the transport.
//!
//! This module provides:
//! - `Endpoint` for tcp, ipc and inproc addresses
//! - the per-topic IPC naming rules shared by the proxy and its consumers
//! - IPC directory preparation

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, RpcError};

/// Topic prefix marking broadcast-to-all delivery.
pub const FANOUT_PREFIX: &str = "fanout~";

/// Base topic carrying call replies back to waiting callers.
pub const REPLY_TOPIC: &str = "zmq_replies";

/// File name prefix of per-topic IPC sockets inside the IPC directory.
const TOPIC_SOCKET_PREFIX: &str = "zmq_topic_";

/// ZMQ endpoint.
///
/// # Examples
///
/// ```
/// use topicwire::transport::Endpoint;
///
/// let ep = Endpoint::parse("tcp://127.0.0.1:9501").unwrap();
/// assert_eq!(ep.zmq_endpoint(), "tcp://127.0.0.1:9501");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Network endpoint.
    ///
    /// Format: `tcp://host:port` (`*` binds every interface)
    Tcp { host: String, port: u16 },

    /// Unix domain socket (IPC) endpoint.
    ///
    /// Format: `ipc:///path/to/socket`
    Ipc { path: PathBuf },

    /// In-process endpoint.
    ///
    /// Format: `inproc://name`
    Inproc { name: String },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc { path: path.into() }
    }

    pub fn inproc(name: impl Into<String>) -> Self {
        Self::Inproc { name: name.into() }
    }

    /// Parse a ZMQ endpoint string.
    ///
    /// An unknown or missing scheme is rejected.
    pub fn parse(endpoint: &str) -> Result<Self> {
        if let Some(name) = endpoint.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(RpcError::Configuration(format!(
                    "empty inproc endpoint: {}",
                    endpoint
                )));
            }
            Ok(Self::inproc(name))
        } else if let Some(path) = endpoint.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(RpcError::Configuration(format!(
                    "empty ipc endpoint: {}",
                    endpoint
                )));
            }
            Ok(Self::ipc(path))
        } else if let Some(rest) = endpoint.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                RpcError::Configuration(format!("tcp endpoint without port: {}", endpoint))
            })?;
            let port = port.parse::<u16>().map_err(|e| {
                RpcError::Configuration(format!("invalid port in {}: {}", endpoint, e))
            })?;
            if host.is_empty() {
                return Err(RpcError::Configuration(format!(
                    "tcp endpoint without host: {}",
                    endpoint
                )));
            }
            Ok(Self::tcp(host, port))
        } else {
            Err(RpcError::Configuration(format!(
                "unsupported endpoint scheme: {}",
                endpoint
            )))
        }
    }

    /// Get the ZMQ endpoint string.
    pub fn zmq_endpoint(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            Self::Ipc { path } => format!("ipc://{}", path.display()),
            Self::Inproc { name } => format!("inproc://{}", name),
        }
    }

    /// Prepare the filesystem before binding.
    ///
    /// For `Ipc`, creates parent directories. Other variants need nothing.
    pub fn prepare_bind(&self) -> Result<()> {
        if let Self::Ipc { path } = self {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.zmq_endpoint())
    }
}

/// First dot-delimited segment of a topic, the key local routing uses.
pub fn base_topic(topic: &str) -> &str {
    topic.split_once('.').map_or(topic, |(base, _)| base)
}

/// Local IPC endpoint serving one base topic.
pub fn topic_endpoint(ipc_dir: &Path, topic: &str) -> Endpoint {
    Endpoint::ipc(ipc_dir.join(format!("{}{}", TOPIC_SOCKET_PREFIX, topic)))
}

/// Whether local delivery for `topic` is broadcast rather than a work queue.
pub fn is_broadcast_topic(topic: &str) -> bool {
    topic.starts_with(FANOUT_PREFIX) || base_topic(topic) == REPLY_TOPIC
}

/// Create the IPC directory with mode 0750 if it does not exist yet.
pub fn ensure_ipc_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))?;
    tracing::info!(ipc_dir = %dir.display(), "created ipc directory");
    Ok(())
}
