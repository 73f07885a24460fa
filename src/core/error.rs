//! # Error Handling Module
//!
//! This module defines the error taxonomy for the discovery/routing/resilience
//! core using the `thiserror` crate, together with the HTTP status mapping that
//! is applied at the gateway boundary. Internal error detail never leaks to
//! external callers beyond the structured error body produced here.
//!
//! Propagation policy:
//! - Registry and lease errors are local: they are logged and surfaced to the
//!   caller of the registry operation, never fatal to the process.
//! - Load-balancer and remote-call errors propagate to the circuit breaker,
//!   which converts sustained failure into fast-fail behavior.
//! - At the gateway boundary every error becomes a bounded HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the gateway core
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classification of remote-call failures
///
/// The declarative remote-call client performs no retries itself; it classifies
/// the failure and leaves retry/fallback decisions to the caller (typically the
/// circuit breaker wrapper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallKind {
    /// The call did not complete within the configured timeout
    Timeout,
    /// The connection could not be established
    ConnectionRefused,
    /// The upstream answered with a 4xx status
    Http4xx(u16),
    /// The upstream answered with a 5xx status
    Http5xx(u16),
    /// Request or response body could not be (de)serialized
    Serialization,
}

impl fmt::Display for RemoteCallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCallKind::Timeout => write!(f, "timeout"),
            RemoteCallKind::ConnectionRefused => write!(f, "connection refused"),
            RemoteCallKind::Http4xx(code) => write!(f, "upstream client error ({})", code),
            RemoteCallKind::Http5xx(code) => write!(f, "upstream server error ({})", code),
            RemoteCallKind::Serialization => write!(f, "serialization error"),
        }
    }
}

/// Error types for the discovery, load-balancing, and routing core
///
/// Each variant represents a different failure category. The `#[error("...")]`
/// attribute from `thiserror` implements `Display` with the given message.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// An instance id was registered under a different service name
    #[error("duplicate instance {instance_id}: already registered under service {existing_service}")]
    DuplicateInstance {
        instance_id: String,
        existing_service: String,
    },

    /// Heartbeat or status change for an instance the registry does not know
    #[error("unknown instance: {instance_id}")]
    UnknownInstance { instance_id: String },

    /// The load balancer found no UP instance for the requested service
    #[error("no available instance for service: {service}")]
    NoAvailableInstance { service: String },

    /// A remote call failed; the kind tells the caller how
    #[error("remote call to {service} failed: {kind}")]
    RemoteCall {
        service: String,
        kind: RemoteCallKind,
    },

    /// The circuit breaker is open and the call was short-circuited
    #[error("circuit breaker open: {name}")]
    CircuitOpen { name: String },

    /// No route predicate matched the incoming request
    #[error("no route matched path: {path}")]
    NoRouteFound { path: String },

    /// Rate limit exceeded on a route filter
    #[error("rate limit exceeded: {limit} requests per {window}")]
    RateLimitExceeded { limit: u32, window: String },

    /// Configuration-related errors (invalid config, missing files, bad routes)
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors for unexpected failures
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a remote-call error for the given target service
    pub fn remote_call<S: Into<String>>(service: S, kind: RemoteCallKind) -> Self {
        Self::RemoteCall {
            service: service.into(),
            kind,
        }
    }

    /// Map this error to the HTTP status code returned at the gateway boundary
    ///
    /// NoRouteFound and NoAvailableInstance both map to 404 but carry distinct
    /// `error_type` markers in the response body so callers can tell a route
    /// mismatch from an empty instance pool.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateInstance { .. } => StatusCode::CONFLICT,
            Self::UnknownInstance { .. } => StatusCode::NOT_FOUND,
            Self::NoAvailableInstance { .. } => StatusCode::NOT_FOUND,
            Self::RemoteCall { kind, .. } => match kind {
                RemoteCallKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                RemoteCallKind::ConnectionRefused => StatusCode::BAD_GATEWAY,
                RemoteCallKind::Http4xx(code) | RemoteCallKind::Http5xx(code) => {
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                RemoteCallKind::Serialization => StatusCode::BAD_GATEWAY,
            },
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoRouteFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// String representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::DuplicateInstance { .. } => "duplicate_instance",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::NoAvailableInstance { .. } => "no_available_instance",
            Self::RemoteCall { .. } => "remote_call_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoRouteFound { .. } => "no_route_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Check if this error is transient and a retry by policy could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoAvailableInstance { .. } => true,
            Self::RemoteCall { kind, .. } => matches!(
                kind,
                RemoteCallKind::Timeout
                    | RemoteCallKind::ConnectionRefused
                    | RemoteCallKind::Http5xx(_)
            ),
            _ => false,
        }
    }

    /// Check if this error should count as a failure for the circuit breaker
    ///
    /// 4xx responses mean the upstream is answering, just with a client error,
    /// so they do not trip the breaker. Local errors (no route, no instance)
    /// say nothing about upstream health either.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            Self::RemoteCall {
                kind: RemoteCallKind::Timeout
                    | RemoteCallKind::ConnectionRefused
                    | RemoteCallKind::Http5xx(_),
                ..
            }
        )
    }

    /// Check whether the upstream actually produced a response
    ///
    /// Distinguishes errors that reached the upstream (and therefore carry
    /// evidence of its health) from local errors that never left the gateway.
    /// The breaker records the former as outcomes and discards the latter.
    pub fn reflects_upstream_response(&self) -> bool {
        matches!(
            self,
            Self::RemoteCall {
                kind: RemoteCallKind::Http4xx(_)
                    | RemoteCallKind::Http5xx(_)
                    | RemoteCallKind::Serialization,
                ..
            }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("json error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("yaml error: {}", err),
        }
    }
}

/// Convert errors into HTTP responses at the gateway boundary
///
/// Only the status code, error type, message, and retryability are exposed;
/// nothing else about the internal failure leaks to external callers.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(error_response)).into_response();

        // Short-circuited calls advertise the breaker so clients can back off.
        if matches!(self, Self::CircuitOpen { .. }) {
            let headers = response.headers_mut();
            headers.insert("x-circuit-breaker", "open".parse().unwrap());
            headers.insert("retry-after", "30".parse().unwrap());
        }

        response
    }
}
