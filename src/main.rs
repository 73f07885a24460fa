//! # msa-gateway - Main Entry Point
//!
//! Wires the components into a running process: load configuration, build the
//! registry and route table, spawn the lease sweeper and config-reload tasks,
//! and serve until SIGTERM/SIGINT.

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use msa_gateway::breaker::CircuitBreakerRegistry;
use msa_gateway::core::config::{ConfigManager, GatewayConfig};
use msa_gateway::core::error::GatewayResult;
use msa_gateway::gateway::router::{RouterHandle, RouteTable};
use msa_gateway::gateway::server::{spawn_config_listener, GatewayServer, GatewayState};
use msa_gateway::load_balancing::LoadBalancerHandle;
use msa_gateway::registry::{LeaseManager, ServiceRegistry};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    init_observability();

    info!("🚀 Starting msa-gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("MSA_GATEWAY_CONFIG")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let config = GatewayConfig::load_from_file(&config_path).await.map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path, routes = config.routes.len(), "Configuration loaded");

    let registry = Arc::new(ServiceRegistry::new(config.registry.lease_ttl()));
    let balancer =
        LoadBalancerHandle::from_policy(Arc::clone(&registry), config.load_balancer.policy);
    let router = Arc::new(RouterHandle::new(RouteTable::from_config(&config)?));
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));

    let sweeper = LeaseManager::new(Arc::clone(&registry), config.registry.sweep_interval).spawn();

    let config_manager = Arc::new(ConfigManager::from_file(config.clone(), &config_path));
    let reload_listener = spawn_config_listener(
        Arc::clone(&router),
        Arc::clone(&breakers),
        config_manager.subscribe(),
    );
    let reload_poller = config_manager.spawn_reload_task(config.registry.sweep_interval);

    let state = GatewayState::new(
        registry,
        balancer,
        router,
        breakers,
        config.upstream.request_timeout,
    );
    let server = GatewayServer::new(state, config.server.clone());

    info!(
        bind = %config.server.bind_address,
        port = config.server.port,
        policy = ?config.load_balancer.policy,
        "Gateway configured"
    );

    server.serve(shutdown_signal()).await?;

    sweeper.abort();
    reload_listener.abort();
    reload_poller.abort();

    info!("✅ msa-gateway shutdown complete");
    Ok(())
}

/// Initialize structured logging
fn init_observability() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "msa_gateway=info,tower_http=info".into()),
        )
        .init();
}

/// Resolve when SIGTERM or SIGINT arrives
async fn shutdown_signal() {
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };
    let sigint = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install SIGINT handler");
        }
    };

    tokio::select! {
        _ = sigterm => info!("📡 Received SIGTERM, shutting down"),
        _ = sigint => info!("📡 Received SIGINT, shutting down"),
    }
}
