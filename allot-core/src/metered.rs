//! Timing and outcome metrics around engine calls.
//!
//! The engine itself records nothing; callers that want numbers wrap it.

use metrics::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info_span};

use crate::engine::IssuanceEngine;
use crate::error::IssuanceError;
use crate::types::{IssuanceRecord, Issued, ReserveRequest, ResourcePolicy, Ticket, TicketView};

pub const ISSUANCE_TOTAL: &str = "allot_issuance_total";
pub const ISSUANCE_DURATION: &str = "allot_issuance_duration_seconds";

#[derive(Clone)]
pub struct MeteredEngine {
    inner: Arc<IssuanceEngine>,
}

impl MeteredEngine {
    pub fn new(inner: Arc<IssuanceEngine>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<IssuanceEngine> {
        &self.inner
    }

    pub async fn activate(&self, policy: ResourcePolicy) -> Result<ResourcePolicy, IssuanceError> {
        observe("activate", self.inner.activate(policy)).await
    }

    pub async fn issue(&self, request: &ReserveRequest) -> Result<Issued, IssuanceError> {
        observe("issue", self.inner.issue(request)).await
    }

    pub async fn reserve(&self, request: &ReserveRequest) -> Result<IssuanceRecord, IssuanceError> {
        observe("reserve", self.inner.reserve(request)).await
    }

    pub async fn reserve_intent(&self, request: &ReserveRequest) -> Result<Ticket, IssuanceError> {
        observe("reserve_intent", self.inner.reserve_intent(request)).await
    }

    pub async fn poll_result(
        &self,
        resource_id: &str,
        ticket_id: &str,
    ) -> Result<TicketView, IssuanceError> {
        observe("poll_result", self.inner.poll_result(resource_id, ticket_id)).await
    }

    pub async fn confirm(
        &self,
        record_id: &str,
        requester_id: &str,
    ) -> Result<IssuanceRecord, IssuanceError> {
        observe("confirm", self.inner.confirm(record_id, requester_id)).await
    }

    pub async fn use_record(
        &self,
        record_id: &str,
        requester_id: &str,
        order_ref: impl Into<String>,
    ) -> Result<IssuanceRecord, IssuanceError> {
        observe(
            "use",
            self.inner.use_record(record_id, requester_id, order_ref),
        )
        .await
    }

    pub async fn cancel(
        &self,
        record_id: &str,
        requester_id: &str,
    ) -> Result<IssuanceRecord, IssuanceError> {
        observe("cancel", self.inner.cancel(record_id, requester_id)).await
    }
}

async fn observe<T, F>(operation: &'static str, call: F) -> Result<T, IssuanceError>
where
    F: Future<Output = Result<T, IssuanceError>>,
{
    let started = Instant::now();
    let result = call.instrument(info_span!("issuance", operation)).await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    counter!(ISSUANCE_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
    histogram!(ISSUANCE_DURATION, "operation" => operation)
        .record(started.elapsed().as_secs_f64());

    result
}
