//! Contracts the engine needs from its collaborators.
//!
//! Every port is async and shared (`&self`): many reserve calls run against
//! the same adapters at once, and only the lock port serializes them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PortError;
use crate::types::{IssuanceRecord, IssuanceStatus, LockHandle, ResourcePolicy};

/// Durable storage for policies and issuance records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_policy(&self, resource_id: &str) -> Result<Option<ResourcePolicy>, PortError>;

    async fn save_policy(&self, policy: &ResourcePolicy) -> Result<(), PortError>;

    /// Most recent record for the pair, if any
    async fn find_record(
        &self,
        resource_id: &str,
        requester_id: &str,
    ) -> Result<Option<IssuanceRecord>, PortError>;

    async fn find_by_id(&self, record_id: &str) -> Result<Option<IssuanceRecord>, PortError>;

    /// Insert or replace by `record_id`
    async fn save(&self, record: IssuanceRecord) -> Result<IssuanceRecord, PortError>;

    /// Eligibility check: does the requester hold a record in any of `blocking`?
    async fn exists_eligible(
        &self,
        resource_id: &str,
        requester_id: &str,
        blocking: &[IssuanceStatus],
    ) -> Result<bool, PortError>;

    /// Sum of quantities over records that currently hold quota
    async fn held_quantity(&self, resource_id: &str) -> Result<i64, PortError>;
}

/// Named, leased mutual exclusion.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait up to `wait` for the lock. `Ok(None)` means the wait ran out.
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, PortError>;

    /// False once the lease expired or someone else took the lock
    async fn is_held_by_caller(&self, handle: &LockHandle) -> Result<bool, PortError>;

    async fn unlock(&self, handle: &LockHandle) -> Result<(), PortError>;
}

/// Shared integer counters.
#[async_trait]
pub trait AtomicCounter: Send + Sync {
    /// Atomically add `delta` (which may be negative) and return the new value.
    /// A missing key counts as zero.
    async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64, PortError>;

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), PortError>;

    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<i64>, PortError>;

    async fn decrement_and_get(&self, key: &str) -> Result<i64, PortError> {
        self.add_and_get(key, -1).await
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, PortError> {
        self.add_and_get(key, 1).await
    }
}

/// Soft key/value state with per-entry expiry.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PortError>;

    async fn delete(&self, key: &str) -> Result<(), PortError>;
}

/// Topic-addressed message transport for deferred issuance.
#[async_trait]
pub trait IntentQueue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), PortError>;

    /// Wait up to `wait` for the next message on `topic`.
    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Vec<u8>>, PortError>;
}

/// Consumer verdict on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, payload: &[u8]) -> Ack;
}

/// The collaborators one engine instance works against.
#[derive(Clone)]
pub struct Ports {
    pub store: Arc<dyn RecordStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub counter: Arc<dyn AtomicCounter>,
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn IntentQueue>,
}

impl Ports {
    /// All five ports backed by process-local adapters.
    pub fn in_memory() -> Self {
        use crate::infrastructure_in_memory::*;

        Self {
            store: Arc::new(InMemoryRecordStore::new()),
            lock: Arc::new(InMemoryLock::new()),
            counter: Arc::new(InMemoryCounter::new()),
            cache: Arc::new(InMemoryCache::new()),
            queue: Arc::new(InMemoryQueue::new()),
        }
    }
}
