//! # Load Balancing Module
//!
//! Client-side load balancing over registry snapshots. A selection policy is
//! polymorphic over a single `select` capability; the handle glues a policy to
//! the instance registry and exposes `choose(service)`.
//!
//! ## Selection policies
//!
//! 1. **Round Robin** (default): per-service atomic cursor, wrap-safe when the
//!    instance list shrinks between calls
//! 2. **Random**: uniform pick
//! 3. **Weighted**: proportional to the `weight` metadata field, default 1

mod strategies;

pub use strategies::{RandomBalancer, RoundRobinBalancer, WeightedBalancer};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::BalancerPolicy;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;
use crate::registry::ServiceRegistry;

/// Core trait for load balancing policies
///
/// `instances` is the already-filtered snapshot of UP instances; policies only
/// decide which index to take. Selection state (cursors) is keyed per service.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select an instance index from the snapshot, or `None` when empty
    async fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<usize>;

    /// Policy name for metrics and logging
    fn policy_name(&self) -> &'static str;
}

/// Load balancer bound to a registry
///
/// The one entry point dependents use: `choose` reads a fresh registry
/// snapshot, applies the policy, and fails with `NoAvailableInstance` when the
/// service has no UP instances.
#[derive(Clone)]
pub struct LoadBalancerHandle {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<dyn LoadBalancer>,
}

impl LoadBalancerHandle {
    pub fn new(registry: Arc<ServiceRegistry>, balancer: Arc<dyn LoadBalancer>) -> Self {
        Self { registry, balancer }
    }

    /// Build a handle for the configured policy
    pub fn from_policy(registry: Arc<ServiceRegistry>, policy: BalancerPolicy) -> Self {
        let balancer: Arc<dyn LoadBalancer> = match policy {
            BalancerPolicy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            BalancerPolicy::Random => Arc::new(RandomBalancer::new()),
            BalancerPolicy::Weighted => Arc::new(WeightedBalancer::new()),
        };
        Self::new(registry, balancer)
    }

    /// Choose one healthy instance of the service
    pub async fn choose(&self, service: &str) -> GatewayResult<ServiceInstance> {
        let instances = self.registry.list_instances(service);

        match self.balancer.select(service, &instances).await {
            Some(index) => {
                let selected = instances[index].clone();
                metrics::counter!("load_balancer_selections").increment(1);
                debug!(
                    service,
                    instance_id = %selected.instance_id,
                    address = %selected.address(),
                    policy = self.balancer.policy_name(),
                    "Selected instance"
                );
                Ok(selected)
            }
            None => {
                metrics::counter!("load_balancer_failed_selections").increment(1);
                Err(GatewayError::NoAvailableInstance {
                    service: service.to_string(),
                })
            }
        }
    }

    /// Name of the active policy
    pub fn policy_name(&self) -> &'static str {
        self.balancer.policy_name()
    }
}
