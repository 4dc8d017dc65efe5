use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IssuanceStatus;

/// Queue message carrying a quota decision that still needs a durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMessage {
    /// Also the id of the record the finalizer writes
    pub ticket_id: String,
    pub resource_id: String,
    pub requester_id: String,
    pub quantity: i64,
    /// Position in the resource's enqueue order
    pub sequence: i64,
    /// Delivery attempts already made
    #[serde(default)]
    pub attempt: u32,
    pub reserved_at: DateTime<Utc>,
}

/// Returned by a deferred reserve; redeem with a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub resource_id: String,
    pub sequence: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    /// A record exists and holds quota
    Confirmed,
    /// A record was written and later canceled
    Canceled,
    Failed,
}

impl TicketStatus {
    /// Outcome of a ticket whose record is in `status`.
    pub fn for_record(status: IssuanceStatus) -> Self {
        match status {
            IssuanceStatus::Reserved | IssuanceStatus::Confirmed | IssuanceStatus::Used => {
                TicketStatus::Confirmed
            }
            IssuanceStatus::Canceled => TicketStatus::Canceled,
            IssuanceStatus::Failed => TicketStatus::Failed,
        }
    }
}

/// Cached state of a ticket, as stored and as returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketView {
    pub ticket_id: String,
    pub resource_id: String,
    pub status: TicketStatus,
    pub sequence: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// 1-based estimate, only while PENDING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_waiting: Option<i64>,
}

impl TicketView {
    pub fn pending(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id.clone(),
            resource_id: ticket.resource_id.clone(),
            status: TicketStatus::Pending,
            sequence: ticket.sequence,
            reason: None,
            queue_position: None,
            total_waiting: None,
        }
    }

    pub fn settled(message: &IntentMessage, status: TicketStatus, reason: Option<String>) -> Self {
        Self {
            ticket_id: message.ticket_id.clone(),
            resource_id: message.resource_id.clone(),
            status,
            sequence: message.sequence,
            reason,
            queue_position: None,
            total_waiting: None,
        }
    }
}

/// What a reserve produced, depending on the policy's issuance mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issued {
    Record(super::IssuanceRecord),
    Ticket(Ticket),
}
