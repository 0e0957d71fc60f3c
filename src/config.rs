//! Configuration types for topicwire
//!
//! Provides configuration for:
//! - ZeroMQ addressing (bind address, port, IPC directory, backlog)
//! - RPC timeouts and the dispatch pool
//! - Matchmaker driver selection and its directory store

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Top-level transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RpcConfig {
    /// ZeroMQ addressing
    pub zmq: ZmqConfig,

    /// Matchmaker selection
    pub matchmaker: MatchMakerConfig,

    /// Timeouts and pool sizing
    pub rpc: RpcTimeouts,
}

impl RpcConfig {
    /// Load configuration from defaults, an optional file, then the environment.
    ///
    /// Environment keys use the `TOPICWIRE__` prefix with `__` between
    /// sections, e.g. `TOPICWIRE__ZMQ__PORT=9601`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOPICWIRE")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.thread_pool_size == 0 {
            return Err(RpcError::Configuration(
                "rpc.thread_pool_size must be at least 1".to_string(),
            ));
        }
        if self.rpc.response_timeout_secs == 0 || self.rpc.cast_timeout_secs == 0 {
            return Err(RpcError::Configuration(
                "rpc timeouts must be greater than zero".to_string(),
            ));
        }
        if self.zmq.topic_backlog == Some(0) {
            return Err(RpcError::Configuration(
                "zmq.topic_backlog must be greater than zero (omit it for unbounded)".to_string(),
            ));
        }
        if self.zmq.io_threads == 0 {
            return Err(RpcError::Configuration(
                "zmq.io_threads must be at least 1".to_string(),
            ));
        }
        if self.zmq.host.is_empty() {
            return Err(RpcError::Configuration("zmq.host must not be empty".to_string()));
        }
        if self.matchmaker.heartbeat_freq_secs == 0 || self.matchmaker.heartbeat_ttl_secs == 0 {
            return Err(RpcError::Configuration(
                "matchmaker heartbeat frequency and ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// ZeroMQ addressing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZmqConfig {
    /// Interface the receiver binds; `*` for all
    pub bind_address: String,

    /// Port the receiver listens on and peers send to
    pub port: u16,

    /// Directory holding the per-topic IPC sockets
    pub ipc_dir: PathBuf,

    /// Per-topic local queue capacity; unbounded when absent
    pub topic_backlog: Option<usize>,

    /// Name of this host as known to peers
    pub host: String,

    /// ZeroMQ I/O threads for the shared context
    pub io_threads: i32,
}

impl Default for ZmqConfig {
    fn default() -> Self {
        Self {
            bind_address: "*".to_string(),
            port: 9501,
            ipc_dir: PathBuf::from("/var/run/topicwire"),
            topic_backlog: None,
            host: local_hostname(),
            io_threads: 1,
        }
    }
}

/// RPC timing and pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcTimeouts {
    /// Seconds to wait for a call reply
    pub response_timeout_secs: u64,

    /// Seconds a single cast send may take
    pub cast_timeout_secs: u64,

    /// Concurrent dispatches per reactor
    pub thread_pool_size: usize,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            response_timeout_secs: 60,
            cast_timeout_secs: 30,
            thread_pool_size: 64,
        }
    }
}

impl RpcTimeouts {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn cast_timeout(&self) -> Duration {
        Duration::from_secs(self.cast_timeout_secs)
    }
}

/// Matchmaker driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMakerDriver {
    /// Everything resolves to the local host
    #[default]
    Localhost,
    /// Topics resolve to themselves without a host
    Stub,
    /// Static ring file
    Ring,
    /// Redis membership sets with heartbeats
    Redis,
}

/// Matchmaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchMakerConfig {
    pub driver: MatchMakerDriver,

    pub redis_host: String,

    pub redis_port: u16,

    /// Seconds between heartbeats
    pub heartbeat_freq_secs: u64,

    /// Seconds a liveness key survives without a heartbeat
    pub heartbeat_ttl_secs: u64,

    /// JSON ring file for the ring driver
    pub ringfile: PathBuf,
}

impl Default for MatchMakerConfig {
    fn default() -> Self {
        Self {
            driver: MatchMakerDriver::default(),
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            heartbeat_freq_secs: 300,
            heartbeat_ttl_secs: 600,
            ringfile: PathBuf::from("/etc/topicwire/matchmaker_ring.json"),
        }
    }
}

impl MatchMakerConfig {
    pub fn heartbeat_freq(&self) -> Duration {
        Duration::from_secs(self.heartbeat_freq_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RpcConfig::default();
        assert_eq!(config.zmq.bind_address, "*");
        assert_eq!(config.zmq.port, 9501);
        assert_eq!(config.zmq.topic_backlog, None);
        assert!(!config.zmq.host.is_empty());
        assert_eq!(config.rpc.response_timeout(), Duration::from_secs(60));
        assert_eq!(config.rpc.cast_timeout(), Duration::from_secs(30));
        assert_eq!(config.rpc.thread_pool_size, 64);
        assert_eq!(config.matchmaker.driver, MatchMakerDriver::Localhost);
        assert_eq!(config.matchmaker.redis_port, 6379);
        assert_eq!(config.matchmaker.heartbeat_ttl_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = RpcConfig::default();
        config.zmq.topic_backlog = Some(0);
        assert!(matches!(config.validate(), Err(RpcError::Configuration(_))));

        let mut config = RpcConfig::default();
        config.rpc.thread_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = RpcConfig::default();
        config.rpc.cast_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RpcConfig::default();
        config.matchmaker.heartbeat_freq_secs = 0;
        assert!(matches!(config.validate(), Err(RpcError::Configuration(_))));

        let mut config = RpcConfig::default();
        config.matchmaker.heartbeat_ttl_secs = 0;
        assert!(matches!(config.validate(), Err(RpcError::Configuration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topicwire.toml");
        std::fs::write(
            &path,
            r#"
[zmq]
port = 9601
topic_backlog = 128
host = "node-a"

[matchmaker]
driver = "redis"
redis_host = "10.0.0.5"

[rpc]
response_timeout_secs = 5
"#,
        )
        .unwrap();

        let config = RpcConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.zmq.port, 9601);
        assert_eq!(config.zmq.topic_backlog, Some(128));
        assert_eq!(config.zmq.host, "node-a");
        assert_eq!(config.matchmaker.driver, MatchMakerDriver::Redis);
        assert_eq!(config.matchmaker.redis_host, "10.0.0.5");
        assert_eq!(config.rpc.response_timeout_secs, 5);
        // untouched keys keep their defaults
        assert_eq!(config.zmq.bind_address, "*");
        assert_eq!(config.rpc.cast_timeout_secs, 30);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[rpc]\nthread_pool_size = 0\n").unwrap();

        assert!(matches!(
            RpcConfig::load(Some(path.as_path())),
            Err(RpcError::Configuration(_))
        ));
    }
}
