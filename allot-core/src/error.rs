use thiserror::Error;

use crate::types::IssuanceStatus;

/// Fault raised by a collaborator behind one of the ports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unlock attempted with a handle that no longer owns the lock
    #[error("lock '{0}' is not held by this handle")]
    NotHeld(String),
}

impl From<serde_json::Error> for PortError {
    fn from(e: serde_json::Error) -> Self {
        PortError::Serialization(e.to_string())
    }
}

/// How a failed issuance should be presented to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Retry shortly
    TryAgain,
    /// Definitively not available
    NotAvailable,
    /// The requester already holds this resource
    AlreadyHave,
    /// Unexpected fault
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuanceError {
    #[error("resource '{resource_id}' is busy, try again shortly")]
    Busy { resource_id: String },

    #[error("resource '{resource_id}' is outside its validity window")]
    OutOfWindow { resource_id: String },

    #[error("requester '{requester_id}' already holds resource '{resource_id}'")]
    AlreadyIssued {
        resource_id: String,
        requester_id: String,
    },

    #[error("resource '{resource_id}' is exhausted")]
    Exhausted { resource_id: String },

    #[error("issuance for resource '{resource_id}' was interrupted")]
    Interrupted { resource_id: String },

    #[error("no policy for resource '{0}'")]
    PolicyNotFound(String),

    #[error("no record '{0}'")]
    RecordNotFound(String),

    /// Neither a ticket view nor a finalized record exists for the id
    #[error("no ticket '{0}'")]
    TicketNotFound(String),

    #[error("cannot move record from {from} to {to}")]
    InvalidTransition {
        from: IssuanceStatus,
        to: IssuanceStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store failure: {0}")]
    Store(PortError),

    #[error("queue failure: {0}")]
    Queue(PortError),

    #[error("lock failure: {0}")]
    Lock(PortError),

    #[error("counter failure: {0}")]
    Counter(PortError),
}

impl IssuanceError {
    /// `Busy` and `Interrupted` are worth retrying; business rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IssuanceError::Busy { .. } | IssuanceError::Interrupted { .. }
        )
    }

    pub fn signal(&self) -> Signal {
        match self {
            IssuanceError::Busy { .. } | IssuanceError::Interrupted { .. } => Signal::TryAgain,
            IssuanceError::OutOfWindow { .. }
            | IssuanceError::Exhausted { .. }
            | IssuanceError::PolicyNotFound(_) => Signal::NotAvailable,
            IssuanceError::AlreadyIssued { .. } => Signal::AlreadyHave,
            _ => Signal::Failure,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IssuanceError::Busy { .. } => "busy",
            IssuanceError::OutOfWindow { .. } => "out_of_window",
            IssuanceError::AlreadyIssued { .. } => "already_issued",
            IssuanceError::Exhausted { .. } => "exhausted",
            IssuanceError::Interrupted { .. } => "interrupted",
            IssuanceError::PolicyNotFound(_) => "policy_not_found",
            IssuanceError::RecordNotFound(_) => "record_not_found",
            IssuanceError::TicketNotFound(_) => "ticket_not_found",
            IssuanceError::InvalidTransition { .. } => "invalid_transition",
            IssuanceError::InvalidRequest(_) => "invalid_request",
            IssuanceError::Store(_) => "store_failure",
            IssuanceError::Queue(_) => "queue_failure",
            IssuanceError::Lock(_) => "lock_failure",
            IssuanceError::Counter(_) => "counter_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
