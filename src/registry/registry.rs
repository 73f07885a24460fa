//! # Instance Registry
//!
//! Process-wide directory mapping service name to the set of live instance
//! records. Backed by `DashMap` so reads never block writers: `list_instances`
//! returns cloned snapshots and mutations touch only the shard of the key
//! involved. Registry changes are fanned out over a broadcast channel for
//! anyone who wants to observe membership (logging, tests, future watchers).
//!
//! Invariant: an instance id appears under at most one service name at a time,
//! enforced by the `owners` reverse index.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{InstanceStatus, ServiceInstance};
use crate::registry::lease::Lease;

/// Registry membership change events
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new instance was registered (or an existing one re-registered)
    Registered(ServiceInstance),
    /// An instance left the registry, voluntarily or by eviction
    Deregistered {
        service: String,
        instance_id: String,
    },
    /// An instance changed lifecycle status
    StatusChanged {
        instance_id: String,
        old_status: InstanceStatus,
        new_status: InstanceStatus,
    },
}

/// Type alias for registry event receiver
pub type RegistryEventReceiver = broadcast::Receiver<RegistryEvent>;

/// The process-wide instance directory
///
/// Explicitly owned and injectable: construct once at startup and hand an
/// `Arc<ServiceRegistry>` to every dependent. Tests may run several
/// independent registries side by side.
pub struct ServiceRegistry {
    /// service name -> instance id -> record
    services: DashMap<String, HashMap<String, ServiceInstance>>,

    /// instance id -> service name (uniqueness invariant + O(1) lookups)
    owners: DashMap<String, String>,

    /// instance id -> liveness lease
    leases: DashMap<String, Lease>,

    /// Lease time-to-live applied to new and renewed leases
    lease_ttl: Duration,

    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    /// Create a registry whose leases expire `lease_ttl` after the last heartbeat
    pub fn new(lease_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            services: DashMap::new(),
            owners: DashMap::new(),
            leases: DashMap::new(),
            lease_ttl,
            events,
        }
    }

    /// Subscribe to membership change events
    pub fn subscribe(&self) -> RegistryEventReceiver {
        self.events.subscribe()
    }

    /// Register an instance
    ///
    /// Fails with `DuplicateInstance` if the instance id is already owned by a
    /// different service. Re-registration under the same service is idempotent
    /// and renews the lease.
    pub fn register(&self, instance: ServiceInstance) -> GatewayResult<()> {
        // Check-and-claim through the owners entry so two concurrent
        // registrations of the same id cannot both pass the check. The owner
        // guard is held until the lease and record are published, keeping
        // concurrent deregisters of this id out of the window in between.
        let owner_guard = match self.owners.entry(instance.instance_id.clone()) {
            Entry::Occupied(owner) => {
                if owner.get() != &instance.service {
                    return Err(GatewayError::DuplicateInstance {
                        instance_id: instance.instance_id.clone(),
                        existing_service: owner.get().clone(),
                    });
                }
                owner.into_ref()
            }
            Entry::Vacant(slot) => slot.insert(instance.service.clone()),
        };

        self.leases.insert(
            instance.instance_id.clone(),
            Lease::new(instance.instance_id.clone(), self.lease_ttl),
        );
        self.services
            .entry(instance.service.clone())
            .or_default()
            .insert(instance.instance_id.clone(), instance.clone());
        drop(owner_guard);

        metrics::counter!("registry_registrations").increment(1);
        info!(
            service = %instance.service,
            instance_id = %instance.instance_id,
            address = %instance.address(),
            "Instance registered"
        );

        let _ = self.events.send(RegistryEvent::Registered(instance));
        Ok(())
    }

    /// Remove an instance; a no-op when the id is not registered
    pub fn deregister(&self, instance_id: &str) {
        let Some((_, service)) = self.owners.remove(instance_id) else {
            return;
        };

        if let Some(mut entry) = self.services.get_mut(&service) {
            entry.remove(instance_id);
        }
        self.services
            .remove_if(&service, |_, instances| instances.is_empty());
        self.leases.remove(instance_id);

        metrics::counter!("registry_deregistrations").increment(1);
        info!(service = %service, instance_id, "Instance deregistered");

        let _ = self.events.send(RegistryEvent::Deregistered {
            service,
            instance_id: instance_id.to_string(),
        });
    }

    /// Renew an instance's lease
    ///
    /// Fails with `UnknownInstance` when the id is not registered; crashed and
    /// evicted instances must re-register, not heartbeat.
    pub fn heartbeat(&self, instance_id: &str) -> GatewayResult<()> {
        match self.leases.get_mut(instance_id) {
            Some(mut lease) => {
                lease.renew();
                debug!(instance_id, "Heartbeat received");
                Ok(())
            }
            None => Err(GatewayError::UnknownInstance {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    /// Change an instance's lifecycle status
    pub fn mark_status(&self, instance_id: &str, status: InstanceStatus) -> GatewayResult<()> {
        let service = self
            .owners
            .get(instance_id)
            .map(|owner| owner.clone())
            .ok_or_else(|| GatewayError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })?;

        let mut entry = self
            .services
            .get_mut(&service)
            .ok_or_else(|| GatewayError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })?;
        let instance = entry
            .get_mut(instance_id)
            .ok_or_else(|| GatewayError::UnknownInstance {
                instance_id: instance_id.to_string(),
            })?;

        let old_status = instance.status;
        instance.status = status;
        drop(entry);

        if old_status != status {
            info!(
                instance_id,
                old = %old_status,
                new = %status,
                "Instance status changed"
            );
            let _ = self.events.send(RegistryEvent::StatusChanged {
                instance_id: instance_id.to_string(),
                old_status,
                new_status: status,
            });
        }
        Ok(())
    }

    /// Snapshot of the current UP instances of a service
    ///
    /// Unknown services yield an empty vec, not an error: the caller (load
    /// balancer) treats "no instances" uniformly.
    pub fn list_instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service)
            .map(|instances| {
                instances
                    .values()
                    .filter(|i| i.is_up())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of all instances of a service regardless of status
    pub fn list_all(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all services with at least one registered instance
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Remaining lease time of an instance, if registered
    pub fn lease_remaining(&self, instance_id: &str) -> Option<Duration> {
        self.leases.get(instance_id).map(|l| l.remaining())
    }

    /// Instance ids whose lease expired before `now`
    ///
    /// Used by the lease sweep; expiry is judged on monotonic elapsed time
    /// since the last heartbeat receipt, never wall clock.
    pub fn expired_instances(&self, now: Instant) -> Vec<String> {
        self.leases
            .iter()
            .filter(|lease| lease.is_expired_at(now))
            .map(|lease| lease.instance_id().to_string())
            .collect()
    }

    /// Evict an instance only if its lease is still expired at `now`
    ///
    /// The expiry re-check runs under the lease shard lock, so a heartbeat
    /// that landed between the expiry snapshot and this call keeps the
    /// instance alive. Returns whether the instance was evicted.
    pub fn deregister_if_expired(&self, instance_id: &str, now: Instant) -> bool {
        let evicted = self
            .leases
            .remove_if(instance_id, |_, lease| lease.is_expired_at(now))
            .is_some();
        if evicted {
            self.deregister(instance_id);
        }
        evicted
    }

    /// Total number of registered instances across all services
    pub fn instance_count(&self) -> usize {
        self.owners.len()
    }
}
