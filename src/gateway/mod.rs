//! # Gateway Module
//!
//! The request-facing half of the crate: route matching, the per-route
//! filter chain, and the axum server that ties routing to the registry,
//! load balancer, and circuit breakers.

pub mod filters;
pub mod router;
pub mod server;

pub use filters::{FilterOutcome, ProxyRequest, RouteFilter};
pub use router::{Route, RouteMatch, RouteTable, RouterHandle};
pub use server::{build_router, spawn_config_listener, GatewayServer, GatewayState};
