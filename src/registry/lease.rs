//! # Heartbeat & Lease Manager
//!
//! Each registered instance holds one lease, created on register, renewed on
//! heartbeat, destroyed on deregister or expiry. The `LeaseManager` runs a
//! periodic sweep that evicts instances whose lease has lapsed; this is the
//! self-healing mechanism that removes crashed instances without manual
//! intervention.
//!
//! Expiry uses monotonic elapsed time (`Instant`) since the last heartbeat
//! receipt. Clock skew across nodes is not compensated.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::registry::ServiceRegistry;

/// Time-bounded liveness claim for one instance
#[derive(Debug, Clone)]
pub struct Lease {
    instance_id: String,
    last_heartbeat: Instant,
    ttl: Duration,
}

impl Lease {
    /// Create a fresh lease starting now
    pub fn new(instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            instance_id: instance_id.into(),
            last_heartbeat: Instant::now(),
            ttl,
        }
    }

    /// Reset the lease clock to now
    pub fn renew(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Instance this lease belongs to
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether the lease had lapsed at the given monotonic point in time
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.ttl
    }

    /// Time left before expiry (zero when already expired)
    pub fn remaining(&self) -> Duration {
        self.ttl
            .saturating_sub(self.last_heartbeat.elapsed())
    }
}

/// Background sweep evicting instances with lapsed leases
///
/// Each eviction is its own bounded critical section (one `deregister` call);
/// the sweep never holds registry-wide locks, so readers are not stalled even
/// while a batch of instances is being removed.
pub struct LeaseManager {
    registry: Arc<ServiceRegistry>,
    sweep_interval: Duration,
}

impl LeaseManager {
    pub fn new(registry: Arc<ServiceRegistry>, sweep_interval: Duration) -> Self {
        Self {
            registry,
            sweep_interval,
        }
    }

    /// Run one sweep pass, returning the evicted instance ids
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for instance_id in self.registry.expired_instances(now) {
            // Expiry is re-checked under the lease lock: a heartbeat may have
            // landed between the snapshot and this eviction.
            if self.registry.deregister_if_expired(&instance_id, now) {
                warn!(instance_id, "Lease expired, evicting instance");
                metrics::counter!("registry_lease_evictions").increment(1);
                evicted.push(instance_id);
            }
        }

        if evicted.is_empty() {
            debug!("Lease sweep found nothing to evict");
        }
        evicted
    }

    /// Spawn the periodic sweep task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}
