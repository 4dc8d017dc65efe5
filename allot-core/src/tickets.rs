//! Status board for deferred reservations.
//!
//! Ticket views live in the cache. Queue position comes from two per-resource
//! counters: how many intents were enqueued and how many reached a final
//! outcome. Their difference is also the in-flight quota reconciliation
//! must account for.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{read_json, write_json};
use crate::error::IssuanceError;
use crate::infrastructure::{AtomicCounter, Cache, RecordStore};
use crate::keys;
use crate::types::{IntentMessage, IssuanceRecord, Ticket, TicketStatus, TicketView};

pub struct TicketBoard {
    cache: Arc<dyn Cache>,
    counter: Arc<dyn AtomicCounter>,
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl TicketBoard {
    pub fn new(
        cache: Arc<dyn Cache>,
        counter: Arc<dyn AtomicCounter>,
        store: Arc<dyn RecordStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            counter,
            store,
            ttl,
        }
    }

    /// Take the next sequence number for `resource_id`.
    pub async fn enqueue(&self, resource_id: &str) -> Result<i64, IssuanceError> {
        self.counter
            .increment_and_get(&keys::enqueued(resource_id))
            .await
            .map_err(IssuanceError::Counter)
    }

    /// Intents reserved against the counter but not yet settled.
    pub async fn in_flight(&self, resource_id: &str) -> Result<i64, IssuanceError> {
        let enqueued = self.read_counter(&keys::enqueued(resource_id)).await?;
        let finalized = self.read_counter(&keys::finalized(resource_id)).await?;
        Ok((enqueued - finalized).max(0))
    }

    pub async fn mark_pending(&self, ticket: &Ticket, requester_id: &str) {
        write_json(
            self.cache.as_ref(),
            &keys::ticket(&ticket.ticket_id),
            &TicketView::pending(ticket),
            self.ttl,
        )
        .await;
        write_json(
            self.cache.as_ref(),
            &keys::pending(&ticket.resource_id, requester_id),
            &ticket.ticket_id,
            self.ttl,
        )
        .await;
    }

    /// Whether the requester has a deferred reservation still in the queue.
    pub async fn is_pending(&self, resource_id: &str, requester_id: &str) -> bool {
        read_json::<String>(self.cache.as_ref(), &keys::pending(resource_id, requester_id))
            .await
            .is_some()
    }

    /// Record the final outcome of an intent and advance the finalized count.
    pub async fn settle(&self, message: &IntentMessage, status: TicketStatus, reason: Option<String>) {
        let view = TicketView::settled(message, status, reason);
        write_json(self.cache.as_ref(), &keys::ticket(&message.ticket_id), &view, self.ttl).await;

        if let Err(e) = self
            .cache
            .delete(&keys::pending(&message.resource_id, &message.requester_id))
            .await
        {
            warn!(ticket_id = %message.ticket_id, error = %e, "failed to clear pending marker");
        }

        if let Err(e) = self
            .counter
            .increment_and_get(&keys::finalized(&message.resource_id))
            .await
        {
            warn!(ticket_id = %message.ticket_id, error = %e, "failed to advance finalized count");
        }
    }

    /// Settle unless the ticket already shows a final outcome. Used on
    /// redelivery so the finalized count advances once per ticket.
    pub async fn settle_once(&self, message: &IntentMessage, status: TicketStatus) {
        let current =
            read_json::<TicketView>(self.cache.as_ref(), &keys::ticket(&message.ticket_id)).await;
        if current.is_some_and(|view| view.status != TicketStatus::Pending) {
            return;
        }
        self.settle(message, status, None).await;
    }

    /// Read-only status lookup. Never touches quota state.
    pub async fn poll(&self, resource_id: &str, ticket_id: &str) -> Result<TicketView, IssuanceError> {
        let cached = read_json::<TicketView>(self.cache.as_ref(), &keys::ticket(ticket_id)).await;

        let mut view = match cached {
            Some(view) => view,
            None => return self.poll_durable(resource_id, ticket_id).await,
        };

        if view.status == TicketStatus::Pending {
            let enqueued = self.read_counter(&keys::enqueued(resource_id)).await?;
            let finalized = self.read_counter(&keys::finalized(resource_id)).await?;
            view.queue_position = Some((view.sequence - finalized).max(1));
            view.total_waiting = Some((enqueued - finalized).max(0));
        }
        Ok(view)
    }

    /// Ticket ids double as record ids, so a lost cache entry can still be
    /// answered from the durable store. An id known to neither is an error,
    /// not a ticket still waiting.
    async fn poll_durable(&self, resource_id: &str, ticket_id: &str) -> Result<TicketView, IssuanceError> {
        let record = self
            .store
            .find_by_id(ticket_id)
            .await
            .map_err(IssuanceError::Store)?
            .filter(|r| r.resource_id == resource_id)
            .ok_or_else(|| IssuanceError::TicketNotFound(ticket_id.to_string()))?;

        Ok(TicketView {
            ticket_id: ticket_id.to_string(),
            resource_id: resource_id.to_string(),
            status: TicketStatus::for_record(record.status),
            sequence: 0,
            reason: None,
            queue_position: None,
            total_waiting: None,
        })
    }

    /// Keep a settled ticket view in step with later moves of its record.
    pub async fn follow_record(&self, record: &IssuanceRecord) {
        let key = keys::ticket(&record.record_id);
        let Some(mut view) = read_json::<TicketView>(self.cache.as_ref(), &key).await else {
            return;
        };
        let status = TicketStatus::for_record(record.status);
        if view.status == TicketStatus::Pending || view.status == status {
            return;
        }
        view.status = status;
        write_json(self.cache.as_ref(), &key, &view, self.ttl).await;
    }

    async fn read_counter(&self, key: &str) -> Result<i64, IssuanceError> {
        Ok(self
            .counter
            .get(key)
            .await
            .map_err(IssuanceError::Counter)?
            .unwrap_or(0))
    }
}
