use serde::Serialize;

use allot_core::types::{IssuanceRecord, Issued, ResourcePolicy, Ticket, TicketView};
use allot_core::{IssuanceError, Signal};

// ─── Input ──────────────────────────────────────────────────────────────────

/// Parse and check a policy document.
pub fn parse_policy(input: &str) -> Result<ResourcePolicy, String> {
    let policy: ResourcePolicy =
        serde_json::from_str(input).map_err(|e| format!("Invalid JSON policy: {e}"))?;
    policy.validate()?;
    Ok(policy)
}

pub fn validate_id(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} is required"));
    }
    Ok(())
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub signal: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl From<&IssuanceError> for ErrorBody {
    fn from(e: &IssuanceError) -> Self {
        Self {
            kind: e.kind(),
            signal: signal_label(e.signal()),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

impl ErrorBody {
    pub fn usage(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid_request",
            signal: signal_label(Signal::Failure),
            retryable: false,
            message: message.into(),
        }
    }
}

fn signal_label(signal: Signal) -> &'static str {
    match signal {
        Signal::TryAgain => "try_again",
        Signal::NotAvailable => "not_available",
        Signal::AlreadyHave => "already_have",
        Signal::Failure => "failure",
    }
}

#[derive(Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum IssueResponse {
    Synchronous { record: IssuanceRecord },
    Deferred {
        ticket: Ticket,
        /// Present when the intent was finalized in this process
        #[serde(skip_serializing_if = "Option::is_none")]
        outcome: Option<TicketView>,
    },
}

impl From<Issued> for IssueResponse {
    fn from(issued: Issued) -> Self {
        match issued {
            Issued::Record(record) => IssueResponse::Synchronous { record },
            Issued::Ticket(ticket) => IssueResponse::Deferred {
                ticket,
                outcome: None,
            },
        }
    }
}

#[derive(Serialize)]
pub struct SimulationReport {
    pub total: i64,
    pub requesters: usize,
    pub deferred: bool,
    pub granted: usize,
    pub exhausted: usize,
    pub busy: usize,
    pub other_errors: usize,
    pub remaining: Option<i64>,
    pub elapsed_ms: u128,
}

#[derive(Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Print a response as pretty JSON on stdout.
pub fn emit<T: Serialize>(response: &ApiResponse<T>) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("Failed to serialize response: {}", e),
    }
}
