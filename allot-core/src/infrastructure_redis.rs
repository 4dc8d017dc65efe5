//! Redis-backed lock, counter, cache and queue.
//!
//! Enable with the `redis` feature flag:
//! ```toml
//! allot-core = { path = "../allot-core", features = ["redis"] }
//! ```
//!
//! The lock is a single-instance lease: `SET NX PX` to acquire, token
//! comparison to check ownership, and a compare-and-delete script to
//! release, so an expired holder can never delete its successor's key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::PortError;
use crate::infrastructure::{AtomicCounter, Cache, DistributedLock, IntentQueue, Ports, RecordStore};
use crate::types::LockHandle;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Pause between `SET NX` attempts while waiting for a held lock.
const LOCK_RETRY: Duration = Duration::from_millis(25);

fn port_error(e: RedisError) -> PortError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        PortError::Connection(e.to_string())
    } else {
        PortError::Command(e.to_string())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

/// Connect a manager to `redis_url`.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, PortError> {
    let client = Client::open(redis_url).map_err(port_error)?;
    ConnectionManager::new(client).await.map_err(port_error)
}

/// Lock, counter, cache and queue on one Redis, records in `store`.
pub async fn ports(redis_url: &str, store: Arc<dyn RecordStore>) -> Result<Ports, PortError> {
    let shared = connect(redis_url).await?;
    let blocking = connect(redis_url).await?;

    Ok(Ports {
        store,
        lock: Arc::new(RedisLock::new(shared.clone())),
        counter: Arc::new(RedisCounter::new(shared.clone())),
        cache: Arc::new(RedisCache::new(shared.clone())),
        queue: Arc::new(RedisQueue::new(shared, blocking)),
    })
}

#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, PortError> {
        let mut conn = self.conn.clone();
        let deadline = Instant::now() + wait;
        let handle = LockHandle::new(name, lease);

        loop {
            let granted: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&handle.token)
                .arg("NX")
                .arg("PX")
                .arg(millis(lease))
                .query_async(&mut conn)
                .await
                .map_err(port_error)?;
            if granted.is_some() {
                return Ok(Some(handle));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY.min(deadline - now)).await;
        }
    }

    async fn is_held_by_caller(&self, handle: &LockHandle) -> Result<bool, PortError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(&handle.name)
            .query_async(&mut conn)
            .await
            .map_err(port_error)?;
        Ok(holder.as_deref() == Some(handle.token.as_str()))
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<(), PortError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&handle.name)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(port_error)?;
        if deleted == 0 {
            return Err(PortError::NotHeld(handle.name.clone()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisCounter {
    conn: ConnectionManager,
}

impl RedisCounter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl AtomicCounter for RedisCounter {
    async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64, PortError> {
        let mut conn = self.conn.clone();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(port_error)
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), PortError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(port_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, PortError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(port_error)
    }
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(port_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PortError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(port_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(port_error)?;
        Ok(())
    }
}

/// List-backed topics. `BLPOP` parks the connection it runs on, so receives
/// get a manager of their own and publishes go over the shared one. A
/// reserve never queues behind a worker's pending `BLPOP`.
#[derive(Clone)]
pub struct RedisQueue {
    publish: ConnectionManager,
    receive: ConnectionManager,
}

impl RedisQueue {
    pub fn new(publish: ConnectionManager, receive: ConnectionManager) -> Self {
        Self { publish, receive }
    }

    fn list_key(topic: &str) -> String {
        format!("queue:{topic}")
    }
}

#[async_trait]
impl IntentQueue for RedisQueue {
    async fn publish(&self, topic: &str, _key: &str, payload: Vec<u8>) -> Result<(), PortError> {
        let mut conn = self.publish.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(Self::list_key(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(port_error)?;
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Vec<u8>>, PortError> {
        let mut conn = self.receive.clone();
        let key = Self::list_key(topic);

        // BLPOP treats 0 as "block forever"
        if wait.is_zero() {
            return redis::cmd("LPOP")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(port_error);
        }

        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(port_error)?;
        Ok(popped.map(|(_, payload)| payload))
    }
}
