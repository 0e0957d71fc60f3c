//! Redis-backed matchmaker.
//!
//! Layout in the store:
//! - set `<topic>` holds members `<topic>.<host>`
//! - key `<topic>.<host>` is a liveness flag with a TTL, value unused
//!
//! A member whose flag has no remaining TTL is dead. It is dropped from
//! the set the next time a lookup trips over it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    BindingKind, BindingTable, DirectExchange, Exchange, Heartbeat, HeartbeatBackend, MatchMaker,
    QueueTarget,
};
use crate::config::MatchMakerConfig;
use crate::error::{Result, RpcError};
use crate::transport::FANOUT_PREFIX;

/// Set and key operations the matchmaker needs from its store.
#[async_trait]
pub trait DirectoryStore: Send + Sync + 'static {
    /// `SMEMBERS set`
    async fn members(&self, set: &str) -> Result<Vec<String>>;

    /// `SRANDMEMBER set`
    async fn random_member(&self, set: &str) -> Result<Option<String>>;

    /// `TTL key`: -2 when missing, -1 when it never expires
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// `EXPIRE key ttl`; false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically `SADD set member` and `SET member ""`
    async fn register_member(&self, set: &str, member: &str) -> Result<()>;

    /// Atomically `SREM set member` and `DEL member`
    async fn evict_member(&self, set: &str, member: &str) -> Result<()>;
}

/// Store talking to a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let client = ::redis::Client::open(format!("redis://{}:{}/", host, port))?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(host = %host, port = port, "connected to redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl DirectoryStore for RedisStore {
    async fn members(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(set).await?;
        Ok(members)
    }

    async fn random_member(&self, set: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let member: Option<String> = conn.srandmember(set).await?;
        Ok(member)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(ttl)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let updated: bool = conn.expire(key, seconds).await?;
        Ok(updated)
    }

    async fn register_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = ::redis::pipe()
            .atomic()
            .sadd(set, member)
            .ignore()
            .set(member, "")
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn evict_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = ::redis::pipe()
            .atomic()
            .srem(set, member)
            .ignore()
            .del(member)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, BTreeSet<String>>,
    /// Key to optional expiry deadline
    keys: HashMap<String, Option<Instant>>,
}

impl MemoryState {
    fn purge_expired(&mut self, key: &str) {
        if let Some(Some(deadline)) = self.keys.get(key) {
            if *deadline <= Instant::now() {
                self.keys.remove(key);
            }
        }
    }
}

/// Process-local store with Redis semantics, on the tokio clock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_member(&self, set: &str, member: &str) -> bool {
        self.state
            .lock()
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.purge_expired(key);
        state.keys.contains_key(key)
    }
}

#[async_trait]
impl DirectoryStore for InMemoryStore {
    async fn members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn random_member(&self, set: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        let mut rng = rand::thread_rng();
        Ok(state
            .sets
            .get(set)
            .and_then(|members| members.iter().choose(&mut rng).cloned()))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        Ok(match state.keys.get(key) {
            None => -2,
            Some(None) => -1,
            Some(Some(deadline)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX)
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge_expired(key);
        match state.keys.get_mut(key) {
            Some(deadline) => {
                *deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn register_member(&self, set: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        state.keys.insert(member.to_string(), None);
        Ok(())
    }

    async fn evict_member(&self, set: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                state.sets.remove(set);
            }
        }
        state.keys.remove(member);
        Ok(())
    }
}

/// Liveness view over a `DirectoryStore`.
pub struct RedisDirectory<S> {
    store: S,
    ttl: Duration,
}

impl<S: DirectoryStore> RedisDirectory<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether `member` of `topic` is fresh; stale members are evicted.
    pub async fn is_alive(&self, topic: &str, member: &str) -> Result<bool> {
        if self.store.ttl(member).await? < 0 {
            self.expire_member(topic, member).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn expire_member(&self, topic: &str, member: &str) -> Result<()> {
        self.store.evict_member(topic, member).await?;
        debug!(topic = %topic, member = %member, "evicted stale member");
        Ok(())
    }
}

#[async_trait]
impl<S: DirectoryStore> HeartbeatBackend for RedisDirectory<S> {
    async fn backend_register(&self, key: &str, key_host: &str) -> Result<()> {
        self.store.register_member(key, key_host).await
    }

    async fn backend_unregister(&self, key: &str, key_host: &str) -> Result<()> {
        self.store.evict_member(key, key_host).await
    }

    async fn ack_alive(&self, key_host: &str) -> Result<bool> {
        self.store.expire(key_host, self.ttl).await
    }
}

fn member_host(member: &str) -> Option<&str> {
    member.split_once('.').map(|(_, host)| host).filter(|host| !host.is_empty())
}

/// One random live member.
pub struct RedisTopicExchange<S> {
    directory: Arc<RedisDirectory<S>>,
}

#[async_trait]
impl<S: DirectoryStore> Exchange for RedisTopicExchange<S> {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        while let Some(member) = self.directory.store.random_member(key).await? {
            if !self.directory.is_alive(key, &member).await? {
                continue;
            }
            match member_host(&member) {
                Some(host) => {
                    let host = host.to_string();
                    return Ok(vec![QueueTarget::new(member, host)]);
                }
                None => {
                    warn!(topic = %key, member = %member, "member without host, evicting");
                    self.directory.expire_member(key, &member).await?;
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Every live member, addressed on its host's fanout channel.
pub struct RedisFanoutExchange<S> {
    directory: Arc<RedisDirectory<S>>,
}

#[async_trait]
impl<S: DirectoryStore> Exchange for RedisFanoutExchange<S> {
    async fn run(&self, key: &str) -> Result<Vec<QueueTarget>> {
        let topic = key.strip_prefix(FANOUT_PREFIX).unwrap_or(key);
        let mut workers = Vec::new();
        for member in self.directory.store.members(topic).await? {
            if !self.directory.is_alive(topic, &member).await? {
                continue;
            }
            if let Some(host) = member_host(&member) {
                workers.push(QueueTarget::new(format!("{}{}", FANOUT_PREFIX, member), host));
            }
        }
        Ok(workers)
    }
}

/// Matchmaker resolving against live Redis membership.
pub struct RedisMatchMaker<S: DirectoryStore = RedisStore> {
    directory: Arc<RedisDirectory<S>>,
    table: BindingTable,
    heartbeat: Heartbeat<RedisDirectory<S>>,
}

impl RedisMatchMaker<RedisStore> {
    pub async fn connect(config: &MatchMakerConfig) -> Result<Self> {
        if config.heartbeat_ttl_secs == 0 {
            return Err(RpcError::Configuration(
                "heartbeat ttl must be greater than zero".to_string(),
            ));
        }
        let store = RedisStore::connect(&config.redis_host, config.redis_port).await?;
        Ok(Self::new(store, config.heartbeat_ttl(), config.heartbeat_freq()))
    }
}

impl<S: DirectoryStore> RedisMatchMaker<S> {
    pub fn new(store: S, ttl: Duration, heartbeat_freq: Duration) -> Self {
        let directory = Arc::new(RedisDirectory::new(store, ttl));
        let mut table = BindingTable::new();
        table.add_binding(
            BindingKind::Fanout,
            Arc::new(RedisFanoutExchange {
                directory: Arc::clone(&directory),
            }),
        );
        table.add_binding(BindingKind::Direct, Arc::new(DirectExchange));
        table.add_binding(
            BindingKind::Topic,
            Arc::new(RedisTopicExchange {
                directory: Arc::clone(&directory),
            }),
        );
        let heartbeat = Heartbeat::new(Arc::clone(&directory), heartbeat_freq);
        Self {
            directory,
            table,
            heartbeat,
        }
    }

    pub fn directory(&self) -> &RedisDirectory<S> {
        &self.directory
    }

    pub fn heartbeat(&self) -> &Heartbeat<RedisDirectory<S>> {
        &self.heartbeat
    }
}

#[async_trait]
impl<S: DirectoryStore> MatchMaker for RedisMatchMaker<S> {
    async fn queues(&self, topic: &str) -> Result<Vec<QueueTarget>> {
        self.table.resolve(topic).await
    }

    async fn register(&self, topic: &str, host: &str) -> Result<()> {
        self.heartbeat.register(topic, host).await
    }

    async fn unregister(&self, topic: &str, host: &str) -> Result<()> {
        self.heartbeat.unregister(topic, host).await
    }

    fn start_heartbeat(&self) -> Result<()> {
        self.heartbeat.start()
    }

    fn stop_heartbeat(&self) {
        self.heartbeat.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn matchmaker() -> RedisMatchMaker<InMemoryStore> {
        RedisMatchMaker::new(InMemoryStore::new(), TTL, Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_host_is_resolved() {
        let mm = matchmaker();
        mm.register("orders", "host1").await.unwrap();

        assert_eq!(
            mm.queues("orders").await.unwrap(),
            vec![QueueTarget::new("orders.host1", "host1")]
        );
        assert_eq!(
            mm.queues("fanout~orders").await.unwrap(),
            vec![QueueTarget::new("fanout~orders.host1", "host1")]
        );
        assert_eq!(
            mm.queues("orders.host7").await.unwrap(),
            vec![QueueTarget::new("orders.host7", "host7")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_host_is_evicted() {
        let mm = matchmaker();
        mm.register("orders", "host1").await.unwrap();
        mm.register("orders", "host2").await.unwrap();

        // host2 keeps heartbeating, host1 goes quiet
        tokio::time::advance(Duration::from_secs(400)).await;
        mm.directory().ack_alive("orders.host2").await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;

        let store = mm.directory().store();
        assert!(store.contains_member("orders", "orders.host1"));

        let fanout = mm.queues("fanout~orders").await.unwrap();
        assert_eq!(fanout, vec![QueueTarget::new("fanout~orders.host2", "host2")]);
        assert!(!store.contains_member("orders", "orders.host1"));
        assert!(!store.contains_key("orders.host1"));

        for _ in 0..5 {
            assert_eq!(
                mm.queues("orders").await.unwrap(),
                vec![QueueTarget::new("orders.host2", "host2")]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_lookup_drains_dead_members() {
        let mm = matchmaker();
        mm.register("orders", "host1").await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(mm.queues("orders").await.unwrap().is_empty());
        assert!(mm.directory().store().members("orders").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_without_expiry_is_stale() {
        let mm = matchmaker();
        let store = mm.directory().store();
        store.register_member("orders", "orders.host1").await.unwrap();
        assert_eq!(store.ttl("orders.host1").await.unwrap(), -1);

        assert!(!mm.directory().is_alive("orders", "orders.host1").await.unwrap());
        assert!(!store.contains_member("orders", "orders.host1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_revives_expired_host() {
        let mm = matchmaker();
        mm.register("orders", "host1").await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(!mm.directory().store().contains_key("orders.host1"));

        mm.heartbeat().send_heartbeats().await;
        assert!(mm.directory().is_alive("orders", "orders.host1").await.unwrap());
        assert_eq!(mm.queues("orders").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_removes_membership() {
        let mm = matchmaker();
        mm.register("orders", "host1").await.unwrap();
        mm.unregister("orders", "host1").await.unwrap();
        assert!(mm.queues("orders").await.unwrap().is_empty());
        assert!(!mm.directory().store().contains_key("orders.host1"));
        assert!(mm.start_heartbeat().is_err());
    }
}
