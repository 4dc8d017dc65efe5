use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for acquiring a resource lock.
///
/// `lease_ms` must exceed the worst-case duration of the locked section,
/// otherwise the lease expires while the holder is still working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTimings {
    /// How long a caller may wait for the lock
    pub wait_ms: u64,
    /// How long a granted lock lives without being released
    pub lease_ms: u64,
}

impl LockTimings {
    pub const fn new(wait_ms: u64, lease_ms: u64) -> Self {
        Self { wait_ms, lease_ms }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Default for LockTimings {
    fn default() -> Self {
        Self::new(3_000, 5_000)
    }
}

/// Proof of a granted lease on a named lock.
///
/// The token is unique per acquisition, so a handle whose lease expired can
/// never be mistaken for the handle of whoever acquired the lock next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
    pub lease: Duration,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            token: nanoid::nanoid!(),
            lease,
        }
    }
}
