//! # Core Types Module
//!
//! Foundational data structures shared across the registry, load balancer,
//! remote-call client, and gateway router. Instances are owned exclusively by
//! the registry; everything handed out of it is a snapshot copy, so `Clone` is
//! implemented liberally and cheap `Arc` sharing is used where payloads matter.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a service instance
///
/// Only `Up` instances are eligible for load-balanced selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Instance is healthy and ready to receive traffic
    Up,
    /// Instance is known to be down
    Down,
    /// Instance is starting up and not yet ready
    Starting,
    /// Instance was administratively taken out of rotation
    OutOfService,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::OutOfService => write!(f, "OUT_OF_SERVICE"),
        }
    }
}

/// One running, network-addressable process of a given service
///
/// Mutated only through registry operations (register, heartbeat, deregister,
/// mark_status); every read path receives a snapshot copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Logical service name this instance belongs to
    pub service: String,

    /// Unique instance identifier (unique across the whole registry)
    pub instance_id: String,

    /// Host name or IP the instance listens on
    pub host: String,

    /// Port the instance listens on
    pub port: u16,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Free-form instance metadata (e.g. `weight` for weighted balancing)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a new UP instance with a generated instance id
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let service = service.into();
        Self {
            instance_id: format!("{}-{}", service, Uuid::new_v4()),
            service,
            host: host.into(),
            port,
            status: InstanceStatus::Up,
            metadata: HashMap::new(),
        }
    }

    /// Override the generated instance id
    pub fn with_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the initial status
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this instance may receive traffic
    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// `host:port` form of the instance address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for HTTP calls against this instance
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Load-balancing weight from the `weight` metadata field, default 1
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse().ok())
            .unwrap_or(1)
    }
}

/// Registration payload accepted on the registry HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub service: String,
    /// Optional caller-chosen instance id; generated when absent
    pub instance_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RegisterRequest {
    /// Build the registry-owned instance record from this request
    pub fn into_instance(self) -> ServiceInstance {
        let mut instance = ServiceInstance::new(self.service, self.host, self.port);
        if let Some(id) = self.instance_id {
            instance.instance_id = id;
        }
        instance.metadata = self.metadata;
        instance
    }
}

/// Response produced by a remote call or by the gateway itself
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Create a simple text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        Self::new(status, headers, Bytes::from(text.into()))
    }

    /// Create a JSON response
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, Bytes::from(body)))
    }

    /// Deserialize the body as JSON
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Whether the status is a 2xx
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
