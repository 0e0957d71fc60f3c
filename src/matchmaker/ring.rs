//! Static ring matchmaker.
//!
//! The ring file maps each topic to the hosts serving it:
//!
//! ```json
//! { "orders": ["host1", "host2"], "billing": ["host3"] }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::{BindingKind, BindingTable, DirectExchange, Exchange, QueueTarget};
use crate::error::{Result, RpcError};
use crate::transport::FANOUT_PREFIX;

/// Topic-to-hosts table with a round-robin cursor per topic.
#[derive(Debug, Default)]
pub struct Ring {
    hosts: HashMap<String, Vec<String>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl Ring {
    pub fn new(hosts: HashMap<String, Vec<String>>) -> Self {
        Self {
            hosts,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RpcError::Configuration(format!("cannot read ringfile {}: {}", path.display(), e))
        })?;
        let hosts = serde_json::from_str(&text).map_err(|e| {
            RpcError::Configuration(format!("invalid ringfile {}: {}", path.display(), e))
        })?;
        Ok(Self::new(hosts))
    }

    pub fn hosts(&self, topic: &str) -> Option<&[String]> {
        self.hosts
            .get(topic)
            .map(Vec::as_slice)
            .filter(|hosts| !hosts.is_empty())
    }

    pub fn next_host(&self, topic: &str) -> Option<String> {
        let hosts = self.hosts(topic)?;
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(topic.to_string()).or_insert(0);
        let host = hosts[*cursor % hosts.len()].clone();
        *cursor = (*cursor + 1) % hosts.len();
        Some(host)
    }
}

/// One host per lookup, cycling through the ring.
pub struct RoundRobinRingExchange {
    ring: Arc<Ring>,
}

impl RoundRobinRingExchange {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl Exchange for RoundRobinRingExchange {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        match self.ring.next_host(key) {
            Some(host) => Ok(vec![QueueTarget::new(format!("{}.{}", key, host), host)]),
            None => {
                warn!(topic = %key, "no ringfile entry for topic");
                Ok(Vec::new())
            }
        }
    }
}

/// Every host of the topic named after the fanout prefix.
pub struct FanoutRingExchange {
    ring: Arc<Ring>,
}

impl FanoutRingExchange {
    pub fn new(ring: Arc<Ring>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl Exchange for FanoutRingExchange {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        let topic = key.strip_prefix(FANOUT_PREFIX).unwrap_or(key);
        match self.ring.hosts(topic) {
            Some(hosts) => Ok(hosts
                .iter()
                .map(|host| QueueTarget::new(format!("{}.{}", key, host), host.clone()))
                .collect()),
            None => {
                warn!(topic = %topic, "no ringfile entry for fanout topic");
                Ok(Vec::new())
            }
        }
    }
}

/// Bindings backed by `ring`.
pub fn ring_matchmaker(ring: Ring) -> BindingTable {
    let ring = Arc::new(ring);
    let mut table = BindingTable::new();
    table.add_binding(BindingKind::Fanout, Arc::new(FanoutRingExchange::new(Arc::clone(&ring))));
    table.add_binding(BindingKind::Direct, Arc::new(DirectExchange));
    table.add_binding(BindingKind::Topic, Arc::new(RoundRobinRingExchange::new(ring)));
    table
}
