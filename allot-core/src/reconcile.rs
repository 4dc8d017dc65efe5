//! Counter repair from durable ground truth.
//!
//! The live counter drifts when a compensation is lost: a record write that
//! failed after its decrement, a crash between publish and compensate. A
//! pass recomputes `total - held - in_flight` and reseeds the counter once
//! the mismatch has been seen often enough to be more than a race.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::IssuanceEngine;
use crate::error::IssuanceError;
use crate::types::ResourcePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    InSync,
    WithinTolerance,
    /// Drift seen, not yet on enough consecutive passes
    Pending { strikes: u32 },
    /// Counter was missing
    Seeded,
    Reseeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub resource_id: String,
    pub total: i64,
    pub held: i64,
    pub in_flight: i64,
    pub durable_remaining: i64,
    /// Counter value before the pass
    pub live: Option<i64>,
    /// `live - durable_remaining`; positive means the counter over-reports
    pub drift: i64,
    pub action: ReconcileAction,
}

pub struct Reconciler {
    engine: Arc<IssuanceEngine>,
    strikes: Mutex<HashMap<String, u32>>,
}

impl Reconciler {
    pub fn new(engine: Arc<IssuanceEngine>) -> Self {
        Self {
            engine,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// One pass for one resource, under the resource lock.
    pub async fn reconcile(&self, resource_id: &str) -> Result<ReconcileReport, IssuanceError> {
        let policy = self
            .engine
            .ports()
            .store
            .load_policy(resource_id)
            .await
            .map_err(IssuanceError::Store)?
            .ok_or_else(|| IssuanceError::PolicyNotFound(resource_id.to_string()))?;

        let guard = self
            .engine
            .acquire(&policy, &CancellationToken::new())
            .await?;
        let result = self.reconcile_locked(&policy).await;
        guard.release().await;
        result
    }

    async fn reconcile_locked(
        &self,
        policy: &ResourcePolicy,
    ) -> Result<ReconcileReport, IssuanceError> {
        let resource_id = policy.resource_id.as_str();
        let count = self.engine.durable_count(policy).await?;
        let durable_remaining = count.remaining(policy.total_quantity);
        let live = self.engine.remaining(resource_id).await?;

        let mut report = ReconcileReport {
            resource_id: resource_id.to_string(),
            total: policy.total_quantity,
            held: count.held,
            in_flight: count.in_flight,
            durable_remaining,
            live,
            drift: 0,
            action: ReconcileAction::InSync,
        };

        let Some(live) = live else {
            self.engine.seed_counter(policy, durable_remaining).await?;
            self.clear_strikes(resource_id);
            info!(resource_id, remaining = durable_remaining, "counter seeded");
            report.action = ReconcileAction::Seeded;
            return Ok(report);
        };

        report.drift = live - durable_remaining;
        if report.drift == 0 {
            self.clear_strikes(resource_id);
            debug!(resource_id, remaining = live, "in sync");
            return Ok(report);
        }

        let tolerance = self.engine.config().reconcile_tolerance;
        if report.drift.abs() <= tolerance {
            self.clear_strikes(resource_id);
            report.action = ReconcileAction::WithinTolerance;
            return Ok(report);
        }

        let strikes = self.strike(resource_id);
        let required = self.engine.config().reconcile_confirmations.max(1);
        if strikes < required {
            warn!(
                resource_id,
                live,
                durable = durable_remaining,
                strikes,
                "counter drift observed"
            );
            report.action = ReconcileAction::Pending { strikes };
            return Ok(report);
        }

        self.engine.seed_counter(policy, durable_remaining).await?;
        self.clear_strikes(resource_id);
        info!(
            resource_id,
            from = live,
            to = durable_remaining,
            "counter reseeded from durable records"
        );
        report.action = ReconcileAction::Reseeded;
        Ok(report)
    }

    /// Reconcile `resource_ids` every `interval` until `shutdown` fires.
    pub async fn run_periodic(
        &self,
        interval: Duration,
        resource_ids: &[String],
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for resource_id in resource_ids {
                if let Err(e) = self.reconcile(resource_id).await {
                    error!(resource_id = %resource_id, error = %e, "reconciliation failed");
                }
            }
        }
    }

    fn strike(&self, resource_id: &str) -> u32 {
        let mut strikes = self.strikes.lock().unwrap_or_else(|e| e.into_inner());
        let entry = strikes.entry(resource_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn clear_strikes(&self, resource_id: &str) {
        self.strikes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(resource_id);
    }
}
