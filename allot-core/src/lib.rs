//! # allot-core
//!
//! Quota-bounded issuance: hand out a strictly limited resource to many
//! concurrent requesters without over-issuing. One leased lock per
//! resource serializes the quota decision; an atomic counter carries the
//! remaining quantity; a durable store holds the records that reconcile it.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "redis")]
#[path = "infrastructure_redis.rs"]
pub mod infrastructure_redis;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod keys;
pub mod metered;
pub mod reconcile;
pub mod state;
pub mod tickets;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::IssuanceEngine;
pub use error::{ConfigError, IssuanceError, PortError, Signal};
pub use finalize::{FinalizeOutcome, FinalizeWorker};
pub use infrastructure::Ports;
pub use metered::MeteredEngine;
pub use reconcile::{ReconcileAction, ReconcileReport, Reconciler};

#[cfg(test)]
mod state_test;
#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod config_test;
#[cfg(test)]
mod metered_test;
