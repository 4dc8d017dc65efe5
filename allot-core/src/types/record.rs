use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuanceStatus {
    Reserved,
    Confirmed,
    Used,
    Canceled,
    Failed,
}

impl IssuanceStatus {
    pub const ALL: [IssuanceStatus; 5] = [
        IssuanceStatus::Reserved,
        IssuanceStatus::Confirmed,
        IssuanceStatus::Used,
        IssuanceStatus::Canceled,
        IssuanceStatus::Failed,
    ];

    /// Statuses whose records consume quota.
    pub const HOLDING: [IssuanceStatus; 3] = [
        IssuanceStatus::Reserved,
        IssuanceStatus::Confirmed,
        IssuanceStatus::Used,
    ];

    /// Returns the numeric index for O(1) matrix lookup
    pub fn to_index(self) -> usize {
        match self {
            IssuanceStatus::Reserved => 0,
            IssuanceStatus::Confirmed => 1,
            IssuanceStatus::Used => 2,
            IssuanceStatus::Canceled => 3,
            IssuanceStatus::Failed => 4,
        }
    }

    pub fn holds_quota(self) -> bool {
        Self::HOLDING.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssuanceStatus::Reserved => "RESERVED",
            IssuanceStatus::Confirmed => "CONFIRMED",
            IssuanceStatus::Used => "USED",
            IssuanceStatus::Canceled => "CANCELED",
            IssuanceStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for IssuanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit (or batch of units) granted to one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    pub record_id: String,
    pub resource_id: String,
    pub requester_id: String,
    /// Units held by this record
    pub quantity: i64,
    pub status: IssuanceStatus,
    /// Order the grant was redeemed against, while USED
    pub order_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IssuanceRecord {
    pub fn new(
        record_id: String,
        resource_id: String,
        requester_id: String,
        quantity: i64,
        status: IssuanceStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id,
            resource_id,
            requester_id,
            quantity,
            status,
            order_ref: None,
            created_at: now,
            confirmed_at: (status == IssuanceStatus::Confirmed).then_some(now),
            used_at: None,
            canceled_at: None,
            updated_at: now,
        }
    }
}

/// Input to a reserve call. The requester is always explicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub resource_id: String,
    pub requester_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

impl ReserveRequest {
    pub fn new(resource_id: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            requester_id: requester_id.into(),
            quantity: 1,
        }
    }

    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.resource_id.is_empty() {
            return Err("resource_id is required".to_string());
        }
        if self.requester_id.is_empty() {
            return Err("requester_id is required".to_string());
        }
        if self.quantity < 1 {
            return Err(format!("quantity must be at least 1 (got {})", self.quantity));
        }
        Ok(())
    }
}
