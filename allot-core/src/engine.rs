//! The issuance engine.
//!
//! Every quota decision runs inside the per-resource lock: window check,
//! eligibility check, counter decrement and, on underflow, the compensating
//! increment. The synchronous path also writes the durable record before
//! releasing; the deferred path publishes an intent instead and leaves the
//! write to the finalize worker.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::SnapshotCache;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{ConfigError, IssuanceError};
use crate::infrastructure::{DistributedLock, Ports};
use crate::keys;
use crate::state::IssuanceStateMachine;
use crate::tickets::TicketBoard;
use crate::types::{
    IntentMessage, IssuanceMode, IssuanceRecord, IssuanceStatus, Issued, LockHandle,
    ReserveRequest, ResourcePolicy, Ticket, TicketStatus, TicketView,
};

/// Quota accounted for by durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DurableCount {
    /// Units in RESERVED, CONFIRMED or USED records
    pub held: i64,
    /// Deferred intents decremented but not yet settled
    pub in_flight: i64,
}

impl DurableCount {
    pub fn remaining(&self, total: i64) -> i64 {
        (total - self.held - self.in_flight).max(0)
    }
}

/// A granted lease that is given back exactly once.
///
/// `release` is the normal path. If the owning future is dropped first, the
/// release is handed to the runtime from `Drop`.
pub(crate) struct LeaseGuard {
    lock: Arc<dyn DistributedLock>,
    handle: Option<LockHandle>,
}

impl LeaseGuard {
    fn new(lock: Arc<dyn DistributedLock>, handle: LockHandle) -> Self {
        Self {
            lock,
            handle: Some(handle),
        }
    }

    pub async fn still_held(&self) -> Result<bool, IssuanceError> {
        match &self.handle {
            Some(handle) => self
                .lock
                .is_held_by_caller(handle)
                .await
                .map_err(IssuanceError::Lock),
            None => Ok(false),
        }
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_if_held(self.lock.as_ref(), &handle).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    release_if_held(lock.as_ref(), &handle).await;
                });
            }
            Err(_) => {
                warn!(lock = %handle.name, "lease dropped outside a runtime, leaving it to expire");
            }
        }
    }
}

/// Unlock only while the lease is still ours. An expired lease may already
/// belong to another caller.
async fn release_if_held(lock: &dyn DistributedLock, handle: &LockHandle) {
    match lock.is_held_by_caller(handle).await {
        Ok(true) => match lock.unlock(handle).await {
            Ok(()) => debug!(lock = %handle.name, "released"),
            Err(e) => warn!(lock = %handle.name, error = %e, "unlock failed"),
        },
        Ok(false) => warn!(lock = %handle.name, "lease expired before release"),
        Err(e) => {
            warn!(lock = %handle.name, error = %e, "could not verify ownership, leaving lease to expire")
        }
    }
}

pub struct IssuanceEngine {
    ports: Ports,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    snapshots: SnapshotCache,
    tickets: TicketBoard,
}

impl IssuanceEngine {
    pub fn new(ports: Ports, config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(ports, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        ports: Ports,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(ports, config, clock))
    }

    /// Engine over process-local adapters with default settings.
    pub fn in_memory() -> Self {
        Self::build(Ports::in_memory(), EngineConfig::default(), Arc::new(SystemClock))
    }

    fn build(ports: Ports, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let snapshots = SnapshotCache::new(
            Arc::clone(&ports.cache),
            Arc::clone(&ports.store),
            Arc::clone(&clock),
            config.snapshot_ttl_floor(),
        );
        let tickets = TicketBoard::new(
            Arc::clone(&ports.cache),
            Arc::clone(&ports.counter),
            Arc::clone(&ports.store),
            config.ticket_ttl(),
        );
        Self {
            ports,
            config,
            clock,
            snapshots,
            tickets,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub(crate) fn tickets(&self) -> &TicketBoard {
        &self.tickets
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Persist a policy and seed its counter from durable records.
    ///
    /// Safe to repeat: reactivation recomputes remaining quantity from what
    /// is already held and in flight.
    pub async fn activate(&self, policy: ResourcePolicy) -> Result<ResourcePolicy, IssuanceError> {
        policy.validate().map_err(IssuanceError::InvalidRequest)?;

        let guard = self.acquire(&policy, &CancellationToken::new()).await?;
        let result = self.activate_locked(&policy).await;
        guard.release().await;
        result?;

        Ok(policy)
    }

    async fn activate_locked(&self, policy: &ResourcePolicy) -> Result<(), IssuanceError> {
        self.ports
            .store
            .save_policy(policy)
            .await
            .map_err(IssuanceError::Store)?;

        let count = self.durable_count(policy).await?;
        let remaining = count.remaining(policy.total_quantity);
        self.seed_counter(policy, remaining).await?;
        self.snapshots.put_policy(policy).await;

        info!(
            resource_id = %policy.resource_id,
            total = policy.total_quantity,
            remaining,
            "policy activated"
        );
        Ok(())
    }

    // ========================================================================
    // Reserve
    // ========================================================================

    /// Reserve along the path the resource's policy selects.
    pub async fn issue(&self, request: &ReserveRequest) -> Result<Issued, IssuanceError> {
        request.validate().map_err(IssuanceError::InvalidRequest)?;
        let policy = self.snapshots.policy(&request.resource_id).await?;
        let cancel = CancellationToken::new();

        match policy.mode {
            IssuanceMode::Synchronous => self
                .reserve_for(&policy, request, &cancel)
                .await
                .map(Issued::Record),
            IssuanceMode::Deferred => self
                .reserve_intent_for(&policy, request, &cancel)
                .await
                .map(Issued::Ticket),
        }
    }

    /// Synchronous reserve: the returned record is already durable.
    pub async fn reserve(&self, request: &ReserveRequest) -> Result<IssuanceRecord, IssuanceError> {
        self.reserve_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn reserve_with_cancel(
        &self,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<IssuanceRecord, IssuanceError> {
        request.validate().map_err(IssuanceError::InvalidRequest)?;
        let policy = self.snapshots.policy(&request.resource_id).await?;
        self.reserve_for(&policy, request, cancel).await
    }

    async fn reserve_for(
        &self,
        policy: &ResourcePolicy,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<IssuanceRecord, IssuanceError> {
        let guard = self.acquire(policy, cancel).await?;
        let result = self.reserve_locked(&guard, policy, request, cancel).await;
        guard.release().await;
        result
    }

    async fn reserve_locked(
        &self,
        guard: &LeaseGuard,
        policy: &ResourcePolicy,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<IssuanceRecord, IssuanceError> {
        let remaining = self.claim(guard, policy, request, cancel).await?;

        let status = if policy.requires_confirmation {
            IssuanceStatus::Reserved
        } else {
            IssuanceStatus::Confirmed
        };
        let record = IssuanceRecord::new(
            nanoid::nanoid!(),
            request.resource_id.clone(),
            request.requester_id.clone(),
            request.quantity,
            status,
            self.clock.now(),
        );

        let record = match self.ports.store.save(record).await {
            Ok(record) => record,
            Err(e) => {
                error!(
                    resource_id = %request.resource_id,
                    requester_id = %request.requester_id,
                    quantity = request.quantity,
                    error = %e,
                    "record write failed after decrement, requires reconciliation"
                );
                return Err(IssuanceError::Store(e));
            }
        };

        self.snapshots.put_record(&record, policy).await;
        info!(
            resource_id = %record.resource_id,
            requester_id = %record.requester_id,
            record_id = %record.record_id,
            status = %record.status,
            remaining,
            "issued"
        );
        Ok(record)
    }

    /// Deferred reserve: decide quota under the lock, publish the intent
    /// after releasing it, and hand back a ticket to poll.
    pub async fn reserve_intent(&self, request: &ReserveRequest) -> Result<Ticket, IssuanceError> {
        self.reserve_intent_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn reserve_intent_with_cancel(
        &self,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<Ticket, IssuanceError> {
        request.validate().map_err(IssuanceError::InvalidRequest)?;
        let policy = self.snapshots.policy(&request.resource_id).await?;
        self.reserve_intent_for(&policy, request, cancel).await
    }

    async fn reserve_intent_for(
        &self,
        policy: &ResourcePolicy,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<Ticket, IssuanceError> {
        let guard = self.acquire(policy, cancel).await?;
        let claimed = self.claim_intent(&guard, policy, request, cancel).await;
        guard.release().await;
        let message = claimed?;

        let ticket = Ticket {
            ticket_id: message.ticket_id.clone(),
            resource_id: message.resource_id.clone(),
            sequence: message.sequence,
        };

        if let Err(e) = self.publish_intent(&message).await {
            warn!(
                resource_id = %message.resource_id,
                ticket_id = %message.ticket_id,
                error = %e,
                "intent publish failed, returning quota"
            );
            // settle even if the return fails, so the intent stops counting
            // as in flight and reconciliation can see the drift
            let returned = self
                .return_quota(&message.resource_id, message.quantity)
                .await;
            self.tickets
                .settle(&message, TicketStatus::Failed, Some(e.to_string()))
                .await;
            returned?;
            return Err(e);
        }

        debug!(
            resource_id = %ticket.resource_id,
            ticket_id = %ticket.ticket_id,
            sequence = ticket.sequence,
            "intent published"
        );
        Ok(ticket)
    }

    async fn claim_intent(
        &self,
        guard: &LeaseGuard,
        policy: &ResourcePolicy,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<IntentMessage, IssuanceError> {
        self.claim(guard, policy, request, cancel).await?;

        let sequence = match self.tickets.enqueue(&request.resource_id).await {
            Ok(sequence) => sequence,
            Err(e) => {
                self.compensate(&request.resource_id, request.quantity)
                    .await?;
                return Err(e);
            }
        };

        let message = IntentMessage {
            ticket_id: nanoid::nanoid!(),
            resource_id: request.resource_id.clone(),
            requester_id: request.requester_id.clone(),
            quantity: request.quantity,
            sequence,
            attempt: 0,
            reserved_at: self.clock.now(),
        };
        let ticket = Ticket {
            ticket_id: message.ticket_id.clone(),
            resource_id: message.resource_id.clone(),
            sequence,
        };
        self.tickets.mark_pending(&ticket, &request.requester_id).await;

        Ok(message)
    }

    async fn publish_intent(&self, message: &IntentMessage) -> Result<(), IssuanceError> {
        let payload = serde_json::to_vec(message).map_err(|e| IssuanceError::Queue(e.into()))?;
        self.ports
            .queue
            .publish(&self.config.intent_topic, &message.ticket_id, payload)
            .await
            .map_err(IssuanceError::Queue)
    }

    /// Status of a deferred reservation. Read-only.
    pub async fn poll_result(
        &self,
        resource_id: &str,
        ticket_id: &str,
    ) -> Result<TicketView, IssuanceError> {
        self.tickets.poll(resource_id, ticket_id).await
    }

    /// Live counter value, `None` while the counter is not seeded.
    pub async fn remaining(&self, resource_id: &str) -> Result<Option<i64>, IssuanceError> {
        self.ports
            .counter
            .get(&keys::remaining(resource_id))
            .await
            .map_err(IssuanceError::Counter)
    }

    // ========================================================================
    // Critical section
    // ========================================================================

    pub(crate) async fn acquire(
        &self,
        policy: &ResourcePolicy,
        cancel: &CancellationToken,
    ) -> Result<LeaseGuard, IssuanceError> {
        let name = keys::lock(&policy.resource_id);
        let timings = policy.lock_timings(self.config.lock);

        let granted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(IssuanceError::Interrupted {
                    resource_id: policy.resource_id.clone(),
                });
            }
            granted = self.ports.lock.try_lock(&name, timings.wait(), timings.lease()) => {
                granted.map_err(IssuanceError::Lock)?
            }
        };

        match granted {
            Some(handle) => {
                debug!(lock = %name, lease_ms = timings.lease_ms, "acquired");
                Ok(LeaseGuard::new(Arc::clone(&self.ports.lock), handle))
            }
            None => {
                warn!(lock = %name, wait_ms = timings.wait_ms, "lock wait timed out");
                Err(IssuanceError::Busy {
                    resource_id: policy.resource_id.clone(),
                })
            }
        }
    }

    /// Window, eligibility and decrement. Returns the remaining count.
    ///
    /// On underflow the decrement is undone before `Exhausted` is returned.
    async fn claim(
        &self,
        guard: &LeaseGuard,
        policy: &ResourcePolicy,
        request: &ReserveRequest,
        cancel: &CancellationToken,
    ) -> Result<i64, IssuanceError> {
        let resource_id = &policy.resource_id;

        if !policy.is_open(self.clock.now()) {
            warn!(resource_id = %resource_id, "outside validity window");
            return Err(IssuanceError::OutOfWindow {
                resource_id: resource_id.clone(),
            });
        }

        if let Some(blocking) = policy.per_requester.blocking_statuses() {
            let issued = self
                .ports
                .store
                .exists_eligible(resource_id, &request.requester_id, blocking)
                .await
                .map_err(IssuanceError::Store)?;
            if issued || self.tickets.is_pending(resource_id, &request.requester_id).await {
                warn!(
                    resource_id = %resource_id,
                    requester_id = %request.requester_id,
                    "already issued"
                );
                return Err(IssuanceError::AlreadyIssued {
                    resource_id: resource_id.clone(),
                    requester_id: request.requester_id.clone(),
                });
            }
        }

        self.ensure_counter(policy).await?;

        if cancel.is_cancelled() {
            return Err(IssuanceError::Interrupted {
                resource_id: resource_id.clone(),
            });
        }
        if !guard.still_held().await? {
            warn!(resource_id = %resource_id, "lease lost before decrement");
            return Err(IssuanceError::Busy {
                resource_id: resource_id.clone(),
            });
        }

        let remaining = self
            .ports
            .counter
            .add_and_get(&keys::remaining(resource_id), -request.quantity)
            .await
            .map_err(IssuanceError::Counter)?;

        if remaining < 0 {
            self.compensate(resource_id, request.quantity).await?;
            warn!(
                resource_id = %resource_id,
                requester_id = %request.requester_id,
                quantity = request.quantity,
                "exhausted"
            );
            return Err(IssuanceError::Exhausted {
                resource_id: resource_id.clone(),
            });
        }

        Ok(remaining)
    }

    /// Seed the counter from durable records when it is missing.
    async fn ensure_counter(&self, policy: &ResourcePolicy) -> Result<(), IssuanceError> {
        let key = keys::remaining(&policy.resource_id);
        let live = self
            .ports
            .counter
            .get(&key)
            .await
            .map_err(IssuanceError::Counter)?;
        if live.is_some() {
            return Ok(());
        }

        let remaining = self
            .durable_count(policy)
            .await?
            .remaining(policy.total_quantity);
        self.seed_counter(policy, remaining).await?;
        info!(
            resource_id = %policy.resource_id,
            remaining,
            "seeded missing counter from durable records"
        );
        Ok(())
    }

    pub(crate) async fn durable_count(
        &self,
        policy: &ResourcePolicy,
    ) -> Result<DurableCount, IssuanceError> {
        let held = self
            .ports
            .store
            .held_quantity(&policy.resource_id)
            .await
            .map_err(IssuanceError::Store)?;
        let in_flight = self.tickets.in_flight(&policy.resource_id).await?;
        Ok(DurableCount { held, in_flight })
    }

    /// The counter outlives the validity window by the configured grace.
    pub(crate) async fn seed_counter(
        &self,
        policy: &ResourcePolicy,
        value: i64,
    ) -> Result<(), IssuanceError> {
        let ttl = policy.ttl_from(self.clock.now(), self.config.snapshot_ttl_floor())
            + self.config.counter_grace();
        self.ports
            .counter
            .set(&keys::remaining(&policy.resource_id), value, Some(ttl))
            .await
            .map_err(IssuanceError::Counter)
    }

    /// Add `quantity` back to a counter known to exist.
    pub(crate) async fn compensate(
        &self,
        resource_id: &str,
        quantity: i64,
    ) -> Result<i64, IssuanceError> {
        match self
            .ports
            .counter
            .add_and_get(&keys::remaining(resource_id), quantity)
            .await
        {
            Ok(restored) => Ok(restored),
            Err(e) => {
                error!(
                    resource_id = %resource_id,
                    quantity,
                    error = %e,
                    "compensating increment failed, requires reconciliation"
                );
                Err(IssuanceError::Counter(e))
            }
        }
    }

    /// Return quota to the counter. A missing counter is left alone: the next
    /// seed recomputes it from durable records, which already reflect the
    /// return.
    pub(crate) async fn return_quota(
        &self,
        resource_id: &str,
        quantity: i64,
    ) -> Result<(), IssuanceError> {
        let live = match self.ports.counter.get(&keys::remaining(resource_id)).await {
            Ok(live) => live,
            Err(e) => {
                error!(
                    resource_id = %resource_id,
                    quantity,
                    error = %e,
                    "quota return failed, requires reconciliation"
                );
                return Err(IssuanceError::Counter(e));
            }
        };
        if live.is_none() {
            debug!(resource_id = %resource_id, "counter absent, skipping return");
            return Ok(());
        }
        self.compensate(resource_id, quantity).await.map(|_| ())
    }

    // ========================================================================
    // Record lifecycle
    // ========================================================================

    pub async fn confirm(
        &self,
        record_id: &str,
        requester_id: &str,
    ) -> Result<IssuanceRecord, IssuanceError> {
        self.transition(record_id, Some(requester_id), IssuanceStatus::Confirmed, None)
            .await
    }

    /// Redeem a grant against an order. The policy window must be open.
    pub async fn use_record(
        &self,
        record_id: &str,
        requester_id: &str,
        order_ref: impl Into<String>,
    ) -> Result<IssuanceRecord, IssuanceError> {
        self.transition(
            record_id,
            Some(requester_id),
            IssuanceStatus::Used,
            Some(order_ref.into()),
        )
        .await
    }

    /// Cancel a grant from any live status, returning its quota.
    pub async fn cancel(
        &self,
        record_id: &str,
        requester_id: &str,
    ) -> Result<IssuanceRecord, IssuanceError> {
        self.transition(record_id, Some(requester_id), IssuanceStatus::Canceled, None)
            .await
    }

    /// Mark a reservation that never completed. Not requester-initiated.
    pub async fn fail(&self, record_id: &str) -> Result<IssuanceRecord, IssuanceError> {
        self.transition(record_id, None, IssuanceStatus::Failed, None)
            .await
    }

    async fn transition(
        &self,
        record_id: &str,
        requester_id: Option<&str>,
        to: IssuanceStatus,
        order_ref: Option<String>,
    ) -> Result<IssuanceRecord, IssuanceError> {
        let record = self.owned_record(record_id, requester_id).await?;
        let policy = self.snapshots.policy(&record.resource_id).await?;

        let guard = self.acquire(&policy, &CancellationToken::new()).await?;
        let result = self
            .transition_locked(&policy, record_id, requester_id, to, order_ref)
            .await;
        guard.release().await;
        result
    }

    async fn transition_locked(
        &self,
        policy: &ResourcePolicy,
        record_id: &str,
        requester_id: Option<&str>,
        to: IssuanceStatus,
        order_ref: Option<String>,
    ) -> Result<IssuanceRecord, IssuanceError> {
        // reload: the record may have moved while we waited for the lock
        let mut record = self.owned_record(record_id, requester_id).await?;
        let now = self.clock.now();

        if to == IssuanceStatus::Used && !policy.is_open(now) {
            return Err(IssuanceError::OutOfWindow {
                resource_id: policy.resource_id.clone(),
            });
        }

        let transition = IssuanceStateMachine::apply(&mut record, to, now, order_ref)?;

        // durable first: a crash before the return under-counts, never over-issues
        let record = self
            .ports
            .store
            .save(record)
            .await
            .map_err(IssuanceError::Store)?;

        if transition.returned_quantity > 0 {
            self.return_quota(&record.resource_id, transition.returned_quantity)
                .await?;
        }

        self.snapshots.put_record(&record, policy).await;
        self.tickets.follow_record(&record).await;
        info!(
            resource_id = %record.resource_id,
            record_id = %record.record_id,
            from = %transition.from,
            to = %transition.to,
            returned = transition.returned_quantity,
            "record transitioned"
        );
        Ok(record)
    }

    async fn owned_record(
        &self,
        record_id: &str,
        requester_id: Option<&str>,
    ) -> Result<IssuanceRecord, IssuanceError> {
        let record = self
            .ports
            .store
            .find_by_id(record_id)
            .await
            .map_err(IssuanceError::Store)?
            .ok_or_else(|| IssuanceError::RecordNotFound(record_id.to_string()))?;

        match requester_id {
            Some(requester) if record.requester_id != requester => {
                Err(IssuanceError::RecordNotFound(record_id.to_string()))
            }
            _ => Ok(record),
        }
    }

    /// Look up a record, cache first.
    pub async fn record(&self, record_id: &str) -> Result<IssuanceRecord, IssuanceError> {
        if let Some(record) = self.snapshots.record(record_id).await {
            return Ok(record);
        }
        self.owned_record(record_id, None).await
    }
}
