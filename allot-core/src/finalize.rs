//! Second half of the deferred path: turn intents into durable records.
//!
//! No lock is taken here. The quota decision was made under the lock when
//! the intent was reserved; finalization only writes the record, or gives
//! the quota back when the record cannot be written.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::IssuanceEngine;
use crate::error::IssuanceError;
use crate::infrastructure::{Ack, MessageHandler};
use crate::types::{IntentMessage, IssuanceRecord, IssuanceStatus, TicketStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Confirmed(IssuanceRecord),
    /// Redelivery of an intent that already has a record
    AlreadyFinalized,
    /// Quota returned, ticket marked FAILED
    Rejected { reason: String },
}

impl IssuanceEngine {
    /// Persist the record for a reserved intent.
    ///
    /// Business rejections (policy gone or invalid, requester already holds
    /// the resource) compensate and settle the ticket. Collaborator faults are
    /// returned so the consumer can nack and retry.
    pub async fn finalize_intent(
        &self,
        message: &IntentMessage,
    ) -> Result<FinalizeOutcome, IssuanceError> {
        let store = &self.ports().store;

        if let Some(existing) = store
            .find_by_id(&message.ticket_id)
            .await
            .map_err(IssuanceError::Store)?
        {
            self.tickets()
                .settle_once(message, TicketStatus::for_record(existing.status))
                .await;
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        let policy = match self.snapshots().policy(&message.resource_id).await {
            Ok(policy) => policy,
            Err(IssuanceError::PolicyNotFound(_)) => {
                return self.reject(message, "policy no longer exists").await;
            }
            Err(e) => return Err(e),
        };
        if let Err(reason) = policy.validate() {
            return self
                .reject(message, &format!("policy is invalid: {reason}"))
                .await;
        }

        if let Some(blocking) = policy.per_requester.blocking_statuses() {
            let issued = store
                .exists_eligible(&message.resource_id, &message.requester_id, blocking)
                .await
                .map_err(IssuanceError::Store)?;
            if issued {
                return self.reject(message, "requester already holds this resource").await;
            }
        }

        let status = if policy.requires_confirmation {
            IssuanceStatus::Reserved
        } else {
            IssuanceStatus::Confirmed
        };
        let mut record = IssuanceRecord::new(
            message.ticket_id.clone(),
            message.resource_id.clone(),
            message.requester_id.clone(),
            message.quantity,
            status,
            self.clock().now(),
        );
        record.created_at = message.reserved_at;

        let record = store.save(record).await.map_err(IssuanceError::Store)?;
        self.snapshots().put_record(&record, &policy).await;
        self.tickets()
            .settle(message, TicketStatus::Confirmed, None)
            .await;

        info!(
            resource_id = %record.resource_id,
            requester_id = %record.requester_id,
            record_id = %record.record_id,
            "intent finalized"
        );
        Ok(FinalizeOutcome::Confirmed(record))
    }

    async fn reject(
        &self,
        message: &IntentMessage,
        reason: &str,
    ) -> Result<FinalizeOutcome, IssuanceError> {
        let returned = self
            .return_quota(&message.resource_id, message.quantity)
            .await;
        self.tickets()
            .settle(message, TicketStatus::Failed, Some(reason.to_string()))
            .await;
        returned?;

        warn!(
            resource_id = %message.resource_id,
            ticket_id = %message.ticket_id,
            reason,
            "intent rejected, quota returned"
        );
        Ok(FinalizeOutcome::Rejected {
            reason: reason.to_string(),
        })
    }

    /// Last stop for an intent whose finalize kept failing: return the quota
    /// unless a record made it to the store after all.
    pub async fn dead_letter(&self, message: &IntentMessage) -> Result<(), IssuanceError> {
        let existing = self
            .ports()
            .store
            .find_by_id(&message.ticket_id)
            .await
            .map_err(IssuanceError::Store)?;
        if let Some(existing) = existing {
            self.tickets()
                .settle_once(message, TicketStatus::for_record(existing.status))
                .await;
            return Ok(());
        }

        let returned = self
            .return_quota(&message.resource_id, message.quantity)
            .await;
        self.tickets()
            .settle(
                message,
                TicketStatus::Failed,
                Some("finalize retries exhausted".to_string()),
            )
            .await;
        returned?;

        error!(
            resource_id = %message.resource_id,
            ticket_id = %message.ticket_id,
            attempts = message.attempt,
            "intent dead-lettered, quota returned"
        );
        Ok(())
    }
}

/// Queue consumer for intents and their dead letters.
pub struct FinalizeWorker {
    engine: Arc<IssuanceEngine>,
    poll_wait: Duration,
}

impl FinalizeWorker {
    pub fn new(engine: Arc<IssuanceEngine>) -> Self {
        Self {
            engine,
            poll_wait: Duration::from_millis(500),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Consume intents until `shutdown` fires. Returns messages handled.
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        let topic = self.engine.config().intent_topic.clone();
        let mut handled = 0;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.engine.ports().queue.receive(&topic, self.poll_wait) => next,
            };

            match next {
                Ok(Some(payload)) => {
                    if let Err(e) = self.dispatch(payload).await {
                        error!(error = %e, "failed to requeue intent");
                    }
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(topic = %topic, error = %e, "receive failed");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }

        info!(handled, "finalize worker stopped");
        handled
    }

    /// Consume dead letters until `shutdown` fires.
    pub async fn run_dead_letters(&self, shutdown: CancellationToken) -> u64 {
        let topic = self.engine.config().dead_letter_topic();
        let mut handled = 0;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.engine.ports().queue.receive(&topic, self.poll_wait) => next,
            };

            match next {
                Ok(Some(payload)) => {
                    self.handle_dead_letter(&payload).await;
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(topic = %topic, error = %e, "receive failed");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }

        handled
    }

    /// Handle everything currently queued, retries included, then return.
    pub async fn drain(&self) -> Result<usize, IssuanceError> {
        let topic = self.engine.config().intent_topic.clone();
        let mut handled = 0;
        while let Some(payload) = self
            .engine
            .ports()
            .queue
            .receive(&topic, Duration::ZERO)
            .await
            .map_err(IssuanceError::Queue)?
        {
            self.dispatch(payload).await?;
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn drain_dead_letters(&self) -> Result<usize, IssuanceError> {
        let topic = self.engine.config().dead_letter_topic();
        let mut handled = 0;
        while let Some(payload) = self
            .engine
            .ports()
            .queue
            .receive(&topic, Duration::ZERO)
            .await
            .map_err(IssuanceError::Queue)?
        {
            self.handle_dead_letter(&payload).await;
            handled += 1;
        }
        Ok(handled)
    }

    /// Nacked intents go back on the topic with the attempt bumped, or to the
    /// dead-letter topic once attempts run out.
    async fn dispatch(&self, payload: Vec<u8>) -> Result<(), IssuanceError> {
        if self.on_message(&payload).await == Ack::Ack {
            return Ok(());
        }

        let Ok(mut message) = serde_json::from_slice::<IntentMessage>(&payload) else {
            return Ok(());
        };
        message.attempt += 1;

        let config = self.engine.config();
        let topic = if message.attempt >= config.max_finalize_attempts {
            warn!(
                ticket_id = %message.ticket_id,
                attempts = message.attempt,
                "finalize attempts exhausted, dead-lettering"
            );
            config.dead_letter_topic()
        } else {
            config.intent_topic.clone()
        };

        let bytes = serde_json::to_vec(&message).map_err(|e| IssuanceError::Queue(e.into()))?;
        self.engine
            .ports()
            .queue
            .publish(&topic, &message.ticket_id, bytes)
            .await
            .map_err(IssuanceError::Queue)
    }

    async fn handle_dead_letter(&self, payload: &[u8]) {
        let message = match serde_json::from_slice::<IntentMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "undecodable dead letter dropped");
                return;
            }
        };
        if let Err(e) = self.engine.dead_letter(&message).await {
            error!(
                ticket_id = %message.ticket_id,
                error = %e,
                "dead letter handling failed, requires reconciliation"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for FinalizeWorker {
    async fn on_message(&self, payload: &[u8]) -> Ack {
        let message = match serde_json::from_slice::<IntentMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                // nothing to retry; park it where an operator can see it
                error!(error = %e, "undecodable intent moved to dead-letter topic");
                let topic = self.engine.config().dead_letter_topic();
                if let Err(e) = self
                    .engine
                    .ports()
                    .queue
                    .publish(&topic, "undecodable", payload.to_vec())
                    .await
                {
                    error!(error = %e, "failed to park undecodable intent");
                }
                return Ack::Ack;
            }
        };

        match self.engine.finalize_intent(&message).await {
            Ok(_) => Ack::Ack,
            Err(e) => {
                warn!(
                    ticket_id = %message.ticket_id,
                    attempt = message.attempt,
                    error = %e,
                    "finalize failed"
                );
                Ack::Nack
            }
        }
    }
}
