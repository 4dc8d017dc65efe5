use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{IssuanceStatus, LockTimings};

/// How many live records a single requester may hold for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerRequester {
    /// Purchases: any number of units, bounded only by remaining quantity
    #[default]
    Unlimited,
    /// Coupons: one grant per requester
    Once {
        /// Whether a canceled grant frees the requester to receive another
        #[serde(default)]
        reissue_after_cancel: bool,
    },
}

impl PerRequester {
    /// Record statuses that make a requester ineligible, or `None` when
    /// eligibility is not checked at all.
    pub fn blocking_statuses(self) -> Option<&'static [IssuanceStatus]> {
        match self {
            PerRequester::Unlimited => None,
            PerRequester::Once {
                reissue_after_cancel: true,
            } => Some(&[
                IssuanceStatus::Reserved,
                IssuanceStatus::Confirmed,
                IssuanceStatus::Used,
            ]),
            PerRequester::Once {
                reissue_after_cancel: false,
            } => Some(&[
                IssuanceStatus::Reserved,
                IssuanceStatus::Confirmed,
                IssuanceStatus::Used,
                IssuanceStatus::Canceled,
            ]),
        }
    }
}

/// Whether the durable record is written inside the reserve call or by a
/// queue consumer afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceMode {
    #[default]
    Synchronous,
    Deferred,
}

/// Administrative definition of a bounded, time-windowed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub resource_id: String,
    pub total_quantity: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub per_requester: PerRequester,
    #[serde(default)]
    pub mode: IssuanceMode,
    /// Records start RESERVED and need an explicit confirm
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Overrides the engine-wide lock timings for this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockTimings>,
    /// Discount terms, sale price and the like; never read by the engine
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResourcePolicy {
    pub fn new(
        resource_id: impl Into<String>,
        total_quantity: i64,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            total_quantity,
            valid_from,
            valid_until,
            per_requester: PerRequester::default(),
            mode: IssuanceMode::default(),
            requires_confirmation: false,
            lock: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_per_requester(mut self, per_requester: PerRequester) -> Self {
        self.per_requester = per_requester;
        self
    }

    pub fn with_mode(mut self, mode: IssuanceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_confirmation(mut self, requires_confirmation: bool) -> Self {
        self.requires_confirmation = requires_confirmation;
        self
    }

    pub fn with_lock(mut self, lock: LockTimings) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.resource_id.is_empty() {
            return Err("resource_id is required".to_string());
        }
        if self.total_quantity < 0 {
            return Err(format!(
                "total_quantity must not be negative (got {})",
                self.total_quantity
            ));
        }
        if self.valid_from >= self.valid_until {
            return Err("valid_from must be before valid_until".to_string());
        }
        if let Some(lock) = self.lock {
            if lock.wait_ms == 0 || lock.lease_ms == 0 {
                return Err("lock wait and lease must be greater than 0".to_string());
            }
        }
        Ok(())
    }

    /// `valid_from <= now <= valid_until`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }

    pub fn lock_timings(&self, default: LockTimings) -> LockTimings {
        self.lock.unwrap_or(default)
    }

    /// Remaining lifetime of the validity window, never shorter than `floor`.
    pub fn ttl_from(&self, now: DateTime<Utc>, floor: Duration) -> Duration {
        (self.valid_until - now)
            .to_std()
            .map(|ttl| ttl.max(floor))
            .unwrap_or(floor)
    }
}
