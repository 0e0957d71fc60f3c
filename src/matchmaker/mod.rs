//! Topic resolution.
//!
//! A matchmaker maps a topic to the live `(routing_name, host)` pairs that
//! should receive it. Resolution runs through an ordered list of bindings;
//! each binding pairs a `BindingKind` test with an `Exchange` strategy.
//!
//! Drivers:
//! - `BindingTable::localhost` - every topic resolves to this host
//! - `BindingTable::stub` - topics resolve to themselves without a host
//! - [`ring`] - static ring file
//! - [`redis`] - membership sets in Redis with heartbeats

pub mod redis;
pub mod ring;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::transport::FANOUT_PREFIX;

pub use self::redis::{DirectoryStore, InMemoryStore, RedisMatchMaker, RedisStore};
pub use self::ring::{Ring, ring_matchmaker};

/// One resolved destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueTarget {
    /// Topic as sent on the wire, usually host-qualified
    pub name: String,
    /// Host to connect to; `None` means the local host
    pub host: Option<String>,
}

impl QueueTarget {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: Some(host.into()),
        }
    }

    pub fn hostless(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }
}

/// Topic shape a binding applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// `fanout~service`
    Fanout,
    /// `service.host`
    Direct,
    /// `service`
    Topic,
}

impl BindingKind {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            BindingKind::Fanout => key.starts_with(FANOUT_PREFIX),
            BindingKind::Direct => key.contains('.'),
            BindingKind::Topic => !key.contains('.'),
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindingKind::Fanout => "fanout",
            BindingKind::Direct => "direct",
            BindingKind::Topic => "topic",
        })
    }
}

/// Strategy producing destinations for a matched key.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>>;
}

/// `service.host` is already fully qualified.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExchange;

#[async_trait]
impl Exchange for DirectExchange {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        match key.split_once('.') {
            Some((_, host)) if !host.is_empty() => Ok(vec![QueueTarget::new(key, host)]),
            _ => Ok(Vec::new()),
        }
    }
}

/// Route every key to one fixed host.
#[derive(Debug, Clone)]
pub struct LocalhostExchange {
    host: String,
}

impl LocalhostExchange {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl Exchange for LocalhostExchange {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        let base = key.split('.').next().unwrap_or(key);
        Ok(vec![QueueTarget::new(format!("{}.{}", base, self.host), self.host.clone())])
    }
}

/// Return the key untouched, without a host.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubExchange;

#[async_trait]
impl Exchange for StubExchange {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        Ok(vec![QueueTarget::hostless(key)])
    }
}

/// Directory of live consumers.
///
/// `queues` returning an empty list is a valid answer meaning nobody is
/// listening; callers treat it as a delivery failure. Drivers without an
/// external directory keep the default no-op registration hooks.
#[async_trait]
pub trait MatchMaker: Send + Sync + 'static {
    async fn queues(&self, topic: &str) -> Result<Vec<QueueTarget>>;

    /// Announce a consumer of `topic` on `host`.
    async fn register(&self, _topic: &str, _host: &str) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self, _topic: &str, _host: &str) -> Result<()> {
        Ok(())
    }

    fn start_heartbeat(&self) -> Result<()> {
        Ok(())
    }

    fn stop_heartbeat(&self) {}
}

struct Binding {
    kind: BindingKind,
    exchange: Arc<dyn Exchange>,
    last: bool,
}

/// Ordered bindings; the first matching `last` binding ends resolution.
#[derive(Default)]
pub struct BindingTable {
    bindings: Vec<Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings resolving everything to `host`.
    pub fn localhost(host: impl Into<String>) -> Self {
        let host = host.into();
        let mut table = Self::new();
        table.add_binding(BindingKind::Fanout, Arc::new(LocalhostExchange::new(host.clone())));
        table.add_binding(BindingKind::Direct, Arc::new(DirectExchange));
        table.add_binding(BindingKind::Topic, Arc::new(LocalhostExchange::new(host)));
        table
    }

    /// Bindings resolving every topic to itself.
    pub fn stub() -> Self {
        let mut table = Self::new();
        table.add_binding(BindingKind::Fanout, Arc::new(StubExchange));
        table.add_binding(BindingKind::Direct, Arc::new(StubExchange));
        table.add_binding(BindingKind::Topic, Arc::new(StubExchange));
        table
    }

    /// Append a binding that stops resolution when it matches.
    pub fn add_binding(&mut self, kind: BindingKind, exchange: Arc<dyn Exchange>) {
        self.add_binding_with(kind, exchange, true);
    }

    pub fn add_binding_with(&mut self, kind: BindingKind, exchange: Arc<dyn Exchange>, last: bool) {
        self.bindings.push(Binding { kind, exchange, last });
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub async fn resolve(&self, key: &str) -> Result<Vec<QueueTarget>> {
        let mut workers = Vec::new();
        for binding in &self.bindings {
            if !binding.kind.matches(key) {
                continue;
            }
            workers.extend(binding.exchange.run(key).await?);
            if binding.last {
                break;
            }
        }
        debug!(topic = %key, matches = workers.len(), "resolved topic");
        Ok(workers)
    }
}

#[async_trait]
impl MatchMaker for BindingTable {
    async fn queues(&self, topic: &str) -> Result<Vec<QueueTarget>> {
        self.resolve(topic).await
    }
}

/// Directory operations heartbeating relies on.
#[async_trait]
pub trait HeartbeatBackend: Send + Sync + 'static {
    /// Add `key_host` to the `key` membership and create its liveness flag.
    async fn backend_register(&self, key: &str, key_host: &str) -> Result<()>;

    async fn backend_unregister(&self, key: &str, key_host: &str) -> Result<()>;

    /// Renew freshness; `false` when the flag no longer exists.
    async fn ack_alive(&self, key_host: &str) -> Result<bool>;
}

/// Registered `(topic, host)` pairs and the periodic renewal task.
pub struct Heartbeat<B: HeartbeatBackend> {
    backend: Arc<B>,
    registrations: Arc<Mutex<BTreeSet<(String, String)>>>,
    freq: Duration,
    beat: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<B: HeartbeatBackend> Heartbeat<B> {
    pub fn new(backend: Arc<B>, freq: Duration) -> Self {
        Self {
            backend,
            registrations: Arc::new(Mutex::new(BTreeSet::new())),
            freq,
            beat: Mutex::new(None),
        }
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        self.registrations.lock().iter().cloned().collect()
    }

    pub async fn register(&self, topic: &str, host: &str) -> Result<()> {
        self.registrations
            .lock()
            .insert((topic.to_string(), host.to_string()));
        let key_host = member_key(topic, host);
        self.backend.backend_register(topic, &key_host).await?;
        self.backend.ack_alive(&key_host).await?;
        info!(topic = %topic, host = %host, "registered consumer");
        Ok(())
    }

    pub async fn unregister(&self, topic: &str, host: &str) -> Result<()> {
        self.registrations
            .lock()
            .remove(&(topic.to_string(), host.to_string()));
        self.backend
            .backend_unregister(topic, &member_key(topic, host))
            .await?;
        info!(topic = %topic, host = %host, "unregistered consumer");
        Ok(())
    }

    /// Renew every registration, re-registering any whose flag is gone.
    pub async fn send_heartbeats(&self) {
        beat(&self.backend, &self.registrations).await;
    }

    /// Spawn the periodic renewal task. Restarting replaces the old task.
    pub fn start(&self) -> Result<()> {
        if self.freq.is_zero() {
            return Err(RpcError::Configuration(
                "heartbeat frequency must be greater than zero".to_string(),
            ));
        }
        if self.registrations.lock().is_empty() {
            return Err(RpcError::MatchMaker(
                "register before starting heartbeat".to_string(),
            ));
        }
        self.stop();

        let token = CancellationToken::new();
        let backend = Arc::clone(&self.backend);
        let registrations = Arc::clone(&self.registrations);
        let freq = self.freq;
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(freq);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => beat(&backend, &registrations).await,
                }
            }
            debug!("heartbeat stopped");
        });
        *self.beat.lock() = Some((token, handle));
        info!(freq_secs = freq.as_secs(), "heartbeat started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some((token, handle)) = self.beat.lock().take() {
            token.cancel();
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.beat.lock().is_some()
    }
}

impl<B: HeartbeatBackend> Drop for Heartbeat<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Membership entry of `host` under `topic`.
pub fn member_key(topic: &str, host: &str) -> String {
    format!("{}.{}", topic, host)
}

async fn beat<B: HeartbeatBackend>(backend: &Arc<B>, registrations: &Mutex<BTreeSet<(String, String)>>) {
    let snapshot: Vec<(String, String)> = registrations.lock().iter().cloned().collect();
    for (topic, host) in snapshot {
        let key_host = member_key(&topic, &host);
        match backend.ack_alive(&key_host).await {
            Ok(true) => continue,
            Ok(false) => debug!(topic = %topic, host = %host, "liveness flag expired, re-registering"),
            Err(e) => warn!(topic = %topic, host = %host, error = %e, "heartbeat failed, re-registering"),
        }
        let result = async {
            backend.backend_register(&topic, &key_host).await?;
            backend.ack_alive(&key_host).await
        }
        .await;
        if let Err(e) = result {
            warn!(topic = %topic, host = %host, error = %e, "re-registration failed");
        }
    }
}
