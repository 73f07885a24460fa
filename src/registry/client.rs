//! Registry client interface consumed from discovery infrastructure.
//!
//! Services talk to the registry through this trait rather than the concrete
//! `ServiceRegistry`, so a remote registry backend can be slotted in without
//! touching callers. The core ships the in-process implementation;
//! the registry is per-process authoritative.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::GatewayResult;
use crate::core::types::ServiceInstance;
use crate::registry::registry::ServiceRegistry;

/// Discovery-infrastructure interface: register self, heartbeat, fetch peers
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register an instance with the registry
    async fn register(&self, instance: ServiceInstance) -> GatewayResult<()>;

    /// Renew an instance's liveness lease
    async fn heartbeat(&self, instance_id: &str) -> GatewayResult<()>;

    /// Remove an instance from the registry
    async fn deregister(&self, instance_id: &str) -> GatewayResult<()>;

    /// Fetch the current UP instances of a service
    async fn fetch_instances(&self, service: &str) -> GatewayResult<Vec<ServiceInstance>>;
}

/// In-process registry client backed directly by `ServiceRegistry`
#[derive(Clone)]
pub struct InProcessRegistryClient {
    registry: Arc<ServiceRegistry>,
}

impl InProcessRegistryClient {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RegistryClient for InProcessRegistryClient {
    async fn register(&self, instance: ServiceInstance) -> GatewayResult<()> {
        self.registry.register(instance)
    }

    async fn heartbeat(&self, instance_id: &str) -> GatewayResult<()> {
        self.registry.heartbeat(instance_id)
    }

    async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        self.registry.deregister(instance_id);
        Ok(())
    }

    async fn fetch_instances(&self, service: &str) -> GatewayResult<Vec<ServiceInstance>> {
        Ok(self.registry.list_instances(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_process_client_round_trip() {
        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(30)));
        let client = InProcessRegistryClient::new(Arc::clone(&registry));

        let instance = ServiceInstance::new("license", "127.0.0.1", 8081).with_id("license-a");
        client.register(instance).await.unwrap();
        client.heartbeat("license-a").await.unwrap();

        let instances = client.fetch_instances("license").await.unwrap();
        assert_eq!(instances.len(), 1);

        client.deregister("license-a").await.unwrap();
        assert!(client.fetch_instances("license").await.unwrap().is_empty());
    }
}
