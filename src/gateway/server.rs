//! # Gateway Server
//!
//! Top-level HTTP entry point wiring the registry, load balancer, route
//! table, and circuit breakers into one axum application:
//!
//! - `/health` liveness probe
//! - `/registry/*` self-registration surface for sidecar services
//! - everything else falls through to the forwarding pipeline:
//!   match route → filter chain → circuit breaker → load-balanced upstream
//!
//! Upstream responses pass through unchanged, including 4xx/5xx statuses;
//! a 5xx still counts as a breaker failure for the route. Transport-level
//! failures are mapped at the boundary (timeout → 504, refused → 502).

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::core::config::{GatewayConfig, ServerSettings};
use crate::core::error::{GatewayError, GatewayResult, RemoteCallKind};
use crate::core::types::{GatewayResponse, RegisterRequest, ServiceInstance};
use crate::gateway::filters::{apply_chain, ProxyRequest};
use crate::gateway::router::{RouteMatch, RouterHandle, RouteTable};
use crate::load_balancing::LoadBalancerHandle;
use crate::registry::ServiceRegistry;

/// Request bodies larger than this are rejected before forwarding
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ServiceRegistry>,
    pub balancer: LoadBalancerHandle,
    pub router: Arc<RouterHandle>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub http: reqwest::Client,
    pub upstream_timeout: Duration,
}

impl GatewayState {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancer: LoadBalancerHandle,
        router: Arc<RouterHandle>,
        breakers: Arc<CircuitBreakerRegistry>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            balancer,
            router,
            breakers,
            http: reqwest::Client::new(),
            upstream_timeout,
        }
    }
}

/// Build the axum application
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/registry/instances", put(register_instance))
        .route(
            "/registry/instances/:instance_id/heartbeat",
            post(heartbeat_instance),
        )
        .route("/registry/instances/:instance_id", delete(deregister_instance))
        .route("/registry/services", get(list_services))
        .route("/registry/services/:service", get(list_service_instances))
        .fallback(forward)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "UP" }))
}

/// `PUT /registry/instances` — register (or re-register) an instance
async fn register_instance(
    State(state): State<GatewayState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let instance = request.into_instance();
    let snapshot = instance.clone();
    state.registry.register(instance)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// `POST /registry/instances/{id}/heartbeat` — renew the instance lease
async fn heartbeat_instance(
    State(state): State<GatewayState>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.registry.heartbeat(&instance_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /registry/instances/{id}` — remove the instance
async fn deregister_instance(
    State(state): State<GatewayState>,
    Path(instance_id): Path<String>,
) -> StatusCode {
    state.registry.deregister(&instance_id);
    StatusCode::NO_CONTENT
}

/// `GET /registry/services` — known service names
async fn list_services(State(state): State<GatewayState>) -> Json<Vec<String>> {
    Json(state.registry.service_names())
}

/// `GET /registry/services/{name}` — UP instances of one service
async fn list_service_instances(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
) -> Json<Vec<ServiceInstance>> {
    Json(state.registry.list_instances(&service))
}

/// Fallback handler: the forwarding pipeline for all proxied traffic
async fn forward(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let matched = state.router.match_route(&path, host.as_deref())?;

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::internal(format!("failed to read request body: {}", e)))?;

    let mut proxy_request = ProxyRequest {
        method: parts.method,
        path: matched.upstream_path.clone(),
        query,
        headers: parts.headers,
        body,
        client_addr: connect_info.map(|ConnectInfo(addr)| addr.ip()),
    };

    if let Some(response) = apply_chain(&matched.route.filters, &mut proxy_request).await? {
        return into_axum_response(response);
    }

    let breaker = state.breakers.get_or_create(&matched.route.id);
    breaker.can_proceed()?;

    let started = std::time::Instant::now();
    let result = forward_upstream(&state, &matched, &proxy_request).await;
    metrics::histogram!("gateway_upstream_duration_seconds")
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            // Upstream 5xx passes through to the caller but still counts
            // against the route's breaker.
            if response.status.is_server_error() {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            metrics::counter!("gateway_forwarded_requests").increment(1);
            into_axum_response(response)
        }
        Err(error) => {
            if error.should_trip_breaker() {
                breaker.record_failure();
            } else if error.reflects_upstream_response() {
                breaker.record_success();
            } else {
                // Never reached the upstream; not evidence either way.
                breaker.record_skipped();
            }
            warn!(route_id = %matched.route.id, error = %error, "Forwarding failed");
            Err(error)
        }
    }
}

/// Send the filtered request to a load-balanced instance of the route target
async fn forward_upstream(
    state: &GatewayState,
    matched: &RouteMatch,
    request: &ProxyRequest,
) -> GatewayResult<GatewayResponse> {
    let instance = state.balancer.choose(&matched.route.service).await?;

    let mut url = format!("{}{}", instance.base_url(), request.path);
    if let Some(query) = &request.query {
        url.push('?');
        url.push_str(query);
    }

    debug!(
        route_id = %matched.route.id,
        instance_id = %instance.instance_id,
        %url,
        "Forwarding to upstream"
    );

    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|_| GatewayError::internal("invalid HTTP method"))?;
    let mut upstream = state
        .http
        .request(method, &url)
        .timeout(state.upstream_timeout)
        .body(request.body.clone());

    for (name, value) in &request.headers {
        // Hop-by-hop and recomputed headers stay behind.
        if name == &header::HOST
            || name == &header::CONTENT_LENGTH
            || name == &header::CONNECTION
            || name == &header::TRANSFER_ENCODING
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream = upstream.header(name, value);
        }
    }
    if let Some(client_addr) = request.client_addr {
        upstream = upstream.header("x-forwarded-for", client_addr.to_string());
    }

    let service = matched.route.service.clone();
    let response = upstream
        .send()
        .await
        .map_err(|e| classify_transport_error(&service, e))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = axum::http::HeaderMap::new();
    for (name, value) in response.headers() {
        if name == &reqwest::header::TRANSFER_ENCODING || name == &reqwest::header::CONNECTION {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_transport_error(&service, e))?;

    Ok(GatewayResponse::new(status, headers, body))
}

fn classify_transport_error(service: &str, error: reqwest::Error) -> GatewayError {
    let kind = if error.is_timeout() {
        RemoteCallKind::Timeout
    } else {
        RemoteCallKind::ConnectionRefused
    };
    GatewayError::remote_call(service, kind)
}

fn into_axum_response(response: GatewayResponse) -> Result<Response, GatewayError> {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| GatewayError::internal(format!("failed to build response: {}", e)))
}

/// React to config reloads: swap the route table and breaker thresholds
pub fn spawn_config_listener(
    router: Arc<RouterHandle>,
    breakers: Arc<CircuitBreakerRegistry>,
    mut changes: broadcast::Receiver<Arc<GatewayConfig>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(config) => match RouteTable::from_config(&config) {
                    Ok(table) => {
                        router.swap(table);
                        breakers.reconfigure(config.breaker.clone());
                        info!("Applied reloaded configuration");
                    }
                    Err(e) => {
                        error!(error = %e, "Reloaded configuration rejected, keeping old table");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Config listener lagged, waiting for next snapshot");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// The listening gateway process
pub struct GatewayServer {
    state: GatewayState,
    settings: ServerSettings,
}

impl GatewayServer {
    pub fn new(state: GatewayState, settings: ServerSettings) -> Self {
        Self { state, settings }
    }

    /// Bind and serve until the shutdown future resolves
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = format!("{}:{}", self.settings.bind_address, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&address).await?;
        info!(%address, "Gateway listening");

        let app = build_router(self.state)
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
