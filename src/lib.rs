//! # msa-gateway - Service Registry & Dynamic Routing Core
//!
//! A discovery-backed API gateway: services self-register and heartbeat into
//! an in-process instance registry, and incoming traffic is matched against a
//! reloadable route table, load-balanced across healthy instances, and
//! shielded by per-route circuit breakers.
//!
//! ## Module layout
//!
//! - [`core`] — error taxonomy, shared data types, configuration and reload
//! - [`registry`] — instance registry plus the heartbeat/lease sweeper
//! - [`load_balancing`] — selection policies over registry snapshots
//! - [`client`] — declarative remote-call client for service-to-service calls
//! - [`breaker`] — failure-rate circuit breaker and its per-target registry
//! - [`gateway`] — route table, filter chain, and the axum server
//!
//! ## Data flow
//!
//! Gateway → route table → filter chain → circuit breaker → load balancer →
//! registry snapshot → upstream instance. The lease sweeper writes to the
//! registry from its own task; readers always operate on snapshots.

pub mod breaker;
pub mod client;
pub mod core;
pub mod gateway;
pub mod load_balancing;
pub mod registry;

pub use crate::core::config::{ConfigManager, GatewayConfig};
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{GatewayResponse, InstanceStatus, ServiceInstance};

pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use client::{CallArgs, OperationDescriptor, RemoteClient};
pub use gateway::{GatewayServer, GatewayState, RouterHandle, RouteTable};
pub use load_balancing::{LoadBalancer, LoadBalancerHandle};
pub use registry::{LeaseManager, RegistryClient, ServiceRegistry};
