//! Cache-aside access to policy and record snapshots.
//!
//! The cache is soft state. Read faults and undecodable entries count as
//! misses, write faults are logged and dropped; nothing here can fail an
//! issuance except the durable store behind it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::IssuanceError;
use crate::infrastructure::{Cache, RecordStore};
use crate::keys;
use crate::types::{IssuanceRecord, ResourcePolicy};

pub(crate) async fn read_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let bytes = match cache.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "cache read failed, treating as miss");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "undecodable cache entry, treating as miss");
            None
        }
    }
}

pub(crate) async fn write_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key, error = %e, "failed to serialize cache entry");
            return;
        }
    };
    if let Err(e) = cache.set(key, bytes, ttl).await {
        warn!(key, error = %e, "cache write failed");
    }
}

pub struct SnapshotCache {
    cache: Arc<dyn Cache>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ttl_floor: Duration,
}

impl SnapshotCache {
    pub fn new(
        cache: Arc<dyn Cache>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        ttl_floor: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            clock,
            ttl_floor,
        }
    }

    /// Read-through policy lookup: cache first, durable store on miss, then
    /// repopulate. Concurrent repopulations overwrite each other harmlessly.
    pub async fn policy(&self, resource_id: &str) -> Result<ResourcePolicy, IssuanceError> {
        let key = keys::policy(resource_id);
        if let Some(policy) = read_json::<ResourcePolicy>(self.cache.as_ref(), &key).await {
            return Ok(policy);
        }

        debug!(resource_id, "policy cache miss");
        let policy = self
            .store
            .load_policy(resource_id)
            .await
            .map_err(IssuanceError::Store)?
            .ok_or_else(|| IssuanceError::PolicyNotFound(resource_id.to_string()))?;

        self.put_policy(&policy).await;
        Ok(policy)
    }

    pub async fn put_policy(&self, policy: &ResourcePolicy) {
        let ttl = policy.ttl_from(self.clock.now(), self.ttl_floor);
        write_json(self.cache.as_ref(), &keys::policy(&policy.resource_id), policy, ttl).await;
    }

    /// Cached record snapshot, if present
    pub async fn record(&self, record_id: &str) -> Option<IssuanceRecord> {
        read_json(self.cache.as_ref(), &keys::record(record_id)).await
    }

    /// Refresh a record snapshot; it lives as long as the policy window.
    pub async fn put_record(&self, record: &IssuanceRecord, policy: &ResourcePolicy) {
        let ttl = policy.ttl_from(self.clock.now(), self.ttl_floor);
        write_json(self.cache.as_ref(), &keys::record(&record.record_id), record, ttl).await;
    }
}
