//! Process-local adapters for every port. Leases, counter keys and cache
//! entries expire on the tokio clock, so paused-time tests can drive them.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::PortError;
use crate::infrastructure::{AtomicCounter, Cache, DistributedLock, IntentQueue, RecordStore};
use crate::types::{IssuanceRecord, IssuanceStatus, LockHandle, ResourcePolicy};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Lock ───────────────────────────────────────────────────────────────────

struct Lease {
    token: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Leased lock table. One entry per held lock name, replaced on every grant
/// and removed on release. An elapsed entry counts as free.
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Grant the lock or report when the current lease runs out.
    fn try_grant(&self, name: &str, lease: Duration) -> Result<LockHandle, Instant> {
        let now = Instant::now();
        let mut leases = guard(&self.leases);

        if let Some(current) = leases.get(name) {
            if current.is_live(now) {
                return Err(current.expires_at);
            }
        }

        let handle = LockHandle::new(name, lease);
        leases.insert(
            name.to_string(),
            Lease {
                token: handle.token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(handle)
    }

    /// Number of locks currently held
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        guard(&self.leases).values().filter(|l| l.is_live(now)).count()
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, PortError> {
        let deadline = Instant::now() + wait;
        loop {
            // Registered before the attempt so a release in between still wakes us.
            let released = self.released.notified();

            let held_until = match self.try_grant(name, lease) {
                Ok(handle) => return Ok(Some(handle)),
                Err(held_until) => held_until,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep_until(held_until.min(deadline)) => {}
            }
        }
    }

    async fn is_held_by_caller(&self, handle: &LockHandle) -> Result<bool, PortError> {
        let now = Instant::now();
        Ok(guard(&self.leases)
            .get(&handle.name)
            .is_some_and(|l| l.token == handle.token && l.is_live(now)))
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<(), PortError> {
        let now = Instant::now();
        {
            let mut leases = guard(&self.leases);
            let held = leases
                .get(&handle.name)
                .is_some_and(|l| l.token == handle.token && l.is_live(now));
            if !held {
                return Err(PortError::NotHeld(handle.name.clone()));
            }
            leases.remove(&handle.name);
        }
        self.released.notify_waiters();
        Ok(())
    }
}

// ─── Counter ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCounter {
    values: Mutex<HashMap<String, (i64, Option<Instant>)>>,
}

impl InMemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live_value(entry: Option<&(i64, Option<Instant>)>, now: Instant) -> Option<(i64, Option<Instant>)> {
    entry
        .filter(|(_, expires_at)| expires_at.is_none_or(|at| at > now))
        .copied()
}

#[async_trait]
impl AtomicCounter for InMemoryCounter {
    async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64, PortError> {
        let now = Instant::now();
        let mut values = guard(&self.values);
        let (current, expires_at) = live_value(values.get(key), now).unwrap_or((0, None));
        let next = current + delta;
        values.insert(key.to_string(), (next, expires_at));
        Ok(next)
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), PortError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        guard(&self.values).insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, PortError> {
        Ok(live_value(guard(&self.values).get(key), Instant::now()).map(|(v, _)| v))
    }
}

// ─── Cache ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PortError> {
        let now = Instant::now();
        Ok(guard(&self.entries)
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), PortError> {
        guard(&self.entries).insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        guard(&self.entries).remove(key);
        Ok(())
    }
}

// ─── Record store ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    policies: HashMap<String, ResourcePolicy>,
    // Record ID -> Record
    records: HashMap<String, IssuanceRecord>,
    // Resource ID -> Record IDs in insertion order
    by_resource: HashMap<String, Vec<String>>,
}

impl Tables {
    fn for_resource<'a>(&'a self, resource_id: &'a str) -> impl Iterator<Item = &'a IssuanceRecord> + 'a {
        self.by_resource
            .get(resource_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
    }
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records for a resource, oldest first
    pub fn records_for(&self, resource_id: &str) -> Vec<IssuanceRecord> {
        guard(&self.tables).for_resource(resource_id).cloned().collect()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load_policy(&self, resource_id: &str) -> Result<Option<ResourcePolicy>, PortError> {
        Ok(guard(&self.tables).policies.get(resource_id).cloned())
    }

    async fn save_policy(&self, policy: &ResourcePolicy) -> Result<(), PortError> {
        guard(&self.tables)
            .policies
            .insert(policy.resource_id.clone(), policy.clone());
        Ok(())
    }

    async fn find_record(
        &self,
        resource_id: &str,
        requester_id: &str,
    ) -> Result<Option<IssuanceRecord>, PortError> {
        Ok(guard(&self.tables)
            .for_resource(resource_id)
            .filter(|r| r.requester_id == requester_id)
            .last()
            .cloned())
    }

    async fn find_by_id(&self, record_id: &str) -> Result<Option<IssuanceRecord>, PortError> {
        Ok(guard(&self.tables).records.get(record_id).cloned())
    }

    async fn save(&self, record: IssuanceRecord) -> Result<IssuanceRecord, PortError> {
        let mut tables = guard(&self.tables);
        if !tables.records.contains_key(&record.record_id) {
            tables
                .by_resource
                .entry(record.resource_id.clone())
                .or_default()
                .push(record.record_id.clone());
        }
        tables.records.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    async fn exists_eligible(
        &self,
        resource_id: &str,
        requester_id: &str,
        blocking: &[IssuanceStatus],
    ) -> Result<bool, PortError> {
        Ok(guard(&self.tables)
            .for_resource(resource_id)
            .any(|r| r.requester_id == requester_id && blocking.contains(&r.status)))
    }

    async fn held_quantity(&self, resource_id: &str) -> Result<i64, PortError> {
        Ok(guard(&self.tables)
            .for_resource(resource_id)
            .filter(|r| r.status.holds_quota())
            .map(|r| r.quantity)
            .sum())
    }
}

// ─── Queue ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    published: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `topic`
    pub fn depth(&self, topic: &str) -> usize {
        guard(&self.topics).get(topic).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl IntentQueue for InMemoryQueue {
    async fn publish(&self, topic: &str, _key: &str, payload: Vec<u8>) -> Result<(), PortError> {
        guard(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .push_back(payload);
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Vec<u8>>, PortError> {
        let deadline = Instant::now() + wait;
        loop {
            let published = self.published.notified();

            if let Some(payload) = guard(&self.topics)
                .get_mut(topic)
                .and_then(VecDeque::pop_front)
            {
                return Ok(Some(payload));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = published => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}
