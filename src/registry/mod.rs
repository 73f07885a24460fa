//! Service registry: the process-wide directory of live instances.
//!
//! The registry is the single owner of `ServiceInstance` records; every
//! mutation goes through its operations and every read hands out a snapshot.
//! Liveness is tracked by leases renewed on heartbeat and swept by the
//! `LeaseManager` background task.

pub mod client;
pub mod lease;
pub mod registry;

pub use client::{InProcessRegistryClient, RegistryClient};
pub use lease::{Lease, LeaseManager};
pub use registry::{RegistryEvent, ServiceRegistry};
