//! # Declarative Remote-Call Client
//!
//! Service-to-service calls described as data instead of hand-written HTTP
//! plumbing. A `RemoteClient` is bound to one target service and holds a set
//! of named operations; callers invoke `client.invoke("get_firm", args)` and
//! the client resolves an instance through the load balancer, substitutes
//! path parameters, and classifies any failure.
//!
//! The client performs no retries and no caching. It classifies failures into
//! `RemoteCallKind` and leaves retry and fallback decisions to the caller,
//! which is usually a circuit breaker wrapper.

use axum::http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult, RemoteCallKind};
use crate::core::types::GatewayResponse;
use crate::load_balancing::LoadBalancerHandle;

/// One named remote operation: method, path template, optional timeout
///
/// Path templates use `{name}` placeholders, e.g. `/v1/firm/{firmId}/license`.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub name: String,
    pub method: Method,
    pub path_template: String,
    /// Per-operation timeout; falls back to the client default when `None`
    pub timeout: Option<Duration>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, method: Method, path_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path_template: path_template.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Arguments for one invocation of an operation
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    path_params: HashMap<String, String>,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<serde_json::Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a `{name}` placeholder in the path template
    pub fn path_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.path_params.insert(name.into(), value.to_string());
        self
    }

    /// Append a query string pair
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a JSON request body
    pub fn json_body<T: serde::Serialize>(mut self, body: &T) -> GatewayResult<Self> {
        self.body = Some(serde_json::to_value(body).map_err(|e| {
            warn!(error = %e, "Failed to serialize request body");
            GatewayError::RemoteCall {
                service: String::new(),
                kind: RemoteCallKind::Serialization,
            }
        })?);
        Ok(self)
    }
}

/// Substitute `{name}` placeholders in a path template
///
/// Parameter values are percent-encoded. Leftover placeholders after
/// substitution are an invocation bug and fail the call locally.
pub fn substitute_path(template: &str, params: &HashMap<String, String>) -> GatewayResult<String> {
    let mut path = template.to_string();
    for (name, value) in params {
        let placeholder = format!("{{{}}}", name);
        path = path.replace(&placeholder, &urlencoding::encode(value));
    }

    if path.contains('{') {
        return Err(GatewayError::internal(format!(
            "unresolved path parameters in template: {}",
            template
        )));
    }
    Ok(path)
}

/// Declarative HTTP client bound to one target service
#[derive(Clone)]
pub struct RemoteClient {
    service: String,
    operations: Arc<HashMap<String, OperationDescriptor>>,
    balancer: LoadBalancerHandle,
    http: reqwest::Client,
    default_timeout: Duration,
}

/// Builder assembling the operation set for a `RemoteClient`
pub struct RemoteClientBuilder {
    service: String,
    operations: HashMap<String, OperationDescriptor>,
    balancer: LoadBalancerHandle,
    default_timeout: Duration,
}

impl RemoteClientBuilder {
    pub fn operation(mut self, descriptor: OperationDescriptor) -> Self {
        self.operations.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> RemoteClient {
        RemoteClient {
            service: self.service,
            operations: Arc::new(self.operations),
            balancer: self.balancer,
            http: reqwest::Client::new(),
            default_timeout: self.default_timeout,
        }
    }
}

impl RemoteClient {
    /// Start building a client for the given service
    pub fn builder(service: impl Into<String>, balancer: LoadBalancerHandle) -> RemoteClientBuilder {
        RemoteClientBuilder {
            service: service.into(),
            operations: HashMap::new(),
            balancer,
            default_timeout: Duration::from_secs(5),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke a named operation against a load-balanced instance
    pub async fn invoke(&self, operation: &str, args: CallArgs) -> GatewayResult<GatewayResponse> {
        let descriptor = self.operations.get(operation).ok_or_else(|| {
            GatewayError::internal(format!(
                "unknown operation {} on service {}",
                operation, self.service
            ))
        })?;

        let instance = self.balancer.choose(&self.service).await?;
        let path = substitute_path(&descriptor.path_template, &args.path_params)?;
        let url = format!("{}{}", instance.base_url(), path);
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);

        debug!(
            service = %self.service,
            operation,
            instance_id = %instance.instance_id,
            %url,
            "Invoking remote operation"
        );

        let method = reqwest::Method::from_bytes(descriptor.method.as_str().as_bytes())
            .map_err(|_| GatewayError::internal("invalid HTTP method"))?;
        let mut request = self.http.request(method, &url).timeout(timeout);

        if !args.query.is_empty() {
            request = request.query(&args.query);
        }
        for (name, value) in &args.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &args.body {
            request = request.json(body);
        }

        let started = std::time::Instant::now();
        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = copy_headers(response.headers());
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        metrics::histogram!("remote_call_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("remote_calls_total").increment(1);

        if status.is_client_error() {
            return Err(GatewayError::remote_call(
                &self.service,
                RemoteCallKind::Http4xx(status.as_u16()),
            ));
        }
        if status.is_server_error() {
            return Err(GatewayError::remote_call(
                &self.service,
                RemoteCallKind::Http5xx(status.as_u16()),
            ));
        }

        Ok(GatewayResponse::new(status, headers, body))
    }

    /// Invoke an operation and deserialize the JSON response body
    pub async fn invoke_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: CallArgs,
    ) -> GatewayResult<T> {
        let response = self.invoke(operation, args).await?;
        response.json_body().map_err(|e| {
            warn!(service = %self.service, operation, error = %e, "Response body mismatch");
            GatewayError::remote_call(&self.service, RemoteCallKind::Serialization)
        })
    }

    /// Invoke an operation, substituting a fallback value on failure
    ///
    /// The degraded-response path: when the call fails for any reason the
    /// fallback closure produces a stand-in value and the error is logged
    /// instead of propagated.
    pub async fn invoke_with_fallback<T, F>(
        &self,
        operation: &str,
        args: CallArgs,
        fallback: F,
    ) -> GatewayResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&GatewayError) -> T,
    {
        match self.invoke_json(operation, args).await {
            Ok(value) => Ok(value),
            Err(error) => {
                warn!(
                    service = %self.service,
                    operation,
                    error = %error,
                    "Remote call failed, serving fallback"
                );
                metrics::counter!("remote_call_fallbacks").increment(1);
                Ok(fallback(&error))
            }
        }
    }

    /// Classify a transport-level failure into a `RemoteCallKind`
    fn classify(&self, error: reqwest::Error) -> GatewayError {
        let kind = if error.is_timeout() {
            RemoteCallKind::Timeout
        } else if error.is_connect() {
            RemoteCallKind::ConnectionRefused
        } else if error.is_decode() {
            RemoteCallKind::Serialization
        } else {
            RemoteCallKind::ConnectionRefused
        };
        warn!(service = %self.service, error = %error, kind = %kind, "Remote call failed");
        GatewayError::remote_call(&self.service, kind)
    }
}

/// Copy reqwest response headers into the axum header map
///
/// reqwest and axum sit on different `http` crate majors here, so the copy
/// goes through raw bytes.
fn copy_headers(source: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in source {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BalancerPolicy;
    use crate::core::types::ServiceInstance;
    use crate::registry::ServiceRegistry;
    use serde::Deserialize;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Firm {
        firm_id: String,
        name: String,
    }

    async fn client_for(server: &MockServer) -> RemoteClient {
        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(30)));
        let address = server.address();
        registry
            .register(
                ServiceInstance::new("firm", address.ip().to_string(), address.port())
                    .with_id("firm-a"),
            )
            .unwrap();
        let balancer = LoadBalancerHandle::from_policy(registry, BalancerPolicy::RoundRobin);

        RemoteClient::builder("firm", balancer)
            .operation(OperationDescriptor::new(
                "get_firm",
                Method::GET,
                "/v1/firm/{firmId}",
            ))
            .operation(
                OperationDescriptor::new("search", Method::GET, "/v1/firm")
                    .with_timeout(Duration::from_millis(100)),
            )
            .build()
    }

    #[test]
    fn test_path_substitution() {
        let params = HashMap::from([("firmId".to_string(), "42".to_string())]);
        assert_eq!(
            substitute_path("/v1/firm/{firmId}", &params).unwrap(),
            "/v1/firm/42"
        );
    }

    #[test]
    fn test_path_substitution_encodes_values() {
        let params = HashMap::from([("name".to_string(), "acme inc".to_string())]);
        assert_eq!(
            substitute_path("/v1/firm/by-name/{name}", &params).unwrap(),
            "/v1/firm/by-name/acme%20inc"
        );
    }

    #[test]
    fn test_unresolved_placeholder_fails_locally() {
        let err = substitute_path("/v1/firm/{firmId}", &HashMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_invoke_json_deserializes_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/firm/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "firm_id": "42",
                "name": "Acme"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let firm: Firm = client
            .invoke_json("get_firm", CallArgs::new().path_param("firmId", 42))
            .await
            .unwrap();

        assert_eq!(firm.firm_id, "42");
        assert_eq!(firm.name, "Acme");
    }

    #[tokio::test]
    async fn test_query_parameters_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/firm"))
            .and(query_param("name", "Acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let response = client
            .invoke("search", CallArgs::new().query("name", "Acme"))
            .await
            .unwrap();

        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_upstream_404_is_classified_as_client_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/firm/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .invoke("get_firm", CallArgs::new().path_param("firmId", 404))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::RemoteCall {
                kind: RemoteCallKind::Http4xx(404),
                ..
            }
        ));
        assert!(!err.should_trip_breaker());
    }

    #[tokio::test]
    async fn test_upstream_500_should_trip_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/firm/1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .invoke("get_firm", CallArgs::new().path_param("firmId", 1))
            .await
            .unwrap_err();

        assert!(err.should_trip_breaker());
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/firm"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.invoke("search", CallArgs::new()).await.unwrap_err();

        assert!(matches!(
            err,
            GatewayError::RemoteCall {
                kind: RemoteCallKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_instance_fails_before_any_io() {
        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(30)));
        let balancer = LoadBalancerHandle::from_policy(registry, BalancerPolicy::RoundRobin);
        let client = RemoteClient::builder("firm", balancer)
            .operation(OperationDescriptor::new("search", Method::GET, "/v1/firm"))
            .build();

        let err = client.invoke("search", CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableInstance { .. }));
    }

    #[tokio::test]
    async fn test_fallback_substitutes_on_failure() {
        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(30)));
        let balancer = LoadBalancerHandle::from_policy(registry, BalancerPolicy::RoundRobin);
        let client = RemoteClient::builder("firm", balancer)
            .operation(OperationDescriptor::new(
                "get_firm",
                Method::GET,
                "/v1/firm/{firmId}",
            ))
            .build();

        let firm = client
            .invoke_with_fallback(
                "get_firm",
                CallArgs::new().path_param("firmId", 7),
                |_| Firm {
                    firm_id: "7".to_string(),
                    name: "unavailable".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(firm.name, "unavailable");
    }

    #[tokio::test]
    async fn test_unknown_operation_is_rejected() {
        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(30)));
        let balancer = LoadBalancerHandle::from_policy(registry, BalancerPolicy::RoundRobin);
        let client = RemoteClient::builder("firm", balancer).build();

        let err = client.invoke("nope", CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal { .. }));
    }
}
