use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::LockTimings;

/// Engine-wide settings. Every field has a default, so a partial document
/// deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock bounds for resources whose policy does not set its own
    pub lock: LockTimings,
    /// Topic deferred intents are published to
    pub intent_topic: String,
    /// Deliveries of one intent before it is dead-lettered
    pub max_finalize_attempts: u32,
    /// Lifetime of ticket status entries
    pub ticket_ttl_secs: u64,
    /// Shortest TTL given to cached snapshots
    pub snapshot_ttl_floor_secs: u64,
    /// Counter keys outlive the validity window by this much
    pub counter_grace_secs: u64,
    /// Drift reconciliation tolerates without reseeding
    pub reconcile_tolerance: i64,
    /// Consecutive drifting passes required before a reseed
    pub reconcile_confirmations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock: LockTimings::default(),
            intent_topic: "issuance-intents".to_string(),
            max_finalize_attempts: 3,
            ticket_ttl_secs: 3_600,
            snapshot_ttl_floor_secs: 60,
            counter_grace_secs: 86_400,
            reconcile_tolerance: 0,
            reconcile_confirmations: 2,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.wait_ms == 0 {
            return Err(ConfigError::Invalid("lock.wait_ms must be greater than 0".into()));
        }
        if self.lock.lease_ms == 0 {
            return Err(ConfigError::Invalid("lock.lease_ms must be greater than 0".into()));
        }
        if self.intent_topic.is_empty() {
            return Err(ConfigError::Invalid("intent_topic is required".into()));
        }
        if self.max_finalize_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_finalize_attempts must be greater than 0".into(),
            ));
        }
        if self.reconcile_tolerance < 0 {
            return Err(ConfigError::Invalid(
                "reconcile_tolerance must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}.DLT", self.intent_topic)
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }

    pub fn snapshot_ttl_floor(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_floor_secs)
    }

    pub fn counter_grace(&self) -> Duration {
        Duration::from_secs(self.counter_grace_secs)
    }
}
