//! Route filter chain.
//!
//! Filters run in declared order before a request is forwarded. Each filter
//! may transform the request in place, short-circuit with a finished
//! response, or fail the request. Filter instances are compiled once per
//! route table and shared across requests, so per-client state (rate-limit
//! buckets) lives inside the filter.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::config::FilterDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::GatewayResponse;

/// Incoming request as seen by the filter chain and the forwarder
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<IpAddr>,
}

impl ProxyRequest {
    /// Rate-limit bucket key for this client
    pub fn client_key(&self) -> String {
        self.client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Result of applying one filter
#[derive(Debug)]
pub enum FilterOutcome {
    /// Request (possibly transformed) continues down the chain
    Continue,
    /// Filter produced the final response; forwarding is skipped
    ShortCircuit(GatewayResponse),
}

/// One step in a route's filter chain
#[async_trait]
pub trait RouteFilter: Send + Sync {
    async fn apply(&self, request: &mut ProxyRequest) -> GatewayResult<FilterOutcome>;

    /// Filter name for logs
    fn name(&self) -> &'static str;
}

/// Set (or overwrite) a request header before forwarding
pub struct SetHeaderFilter {
    name: String,
    value: String,
}

#[async_trait]
impl RouteFilter for SetHeaderFilter {
    async fn apply(&self, request: &mut ProxyRequest) -> GatewayResult<FilterOutcome> {
        let name: axum::http::HeaderName = self
            .name
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid header name: {}", self.name)))?;
        let value: axum::http::HeaderValue = self
            .value
            .parse()
            .map_err(|_| GatewayError::config(format!("invalid header value for {}", self.name)))?;
        request.headers.insert(name, value);
        Ok(FilterOutcome::Continue)
    }

    fn name(&self) -> &'static str {
        "set_header"
    }
}

/// Remove a request header before forwarding
pub struct RemoveHeaderFilter {
    name: String,
}

#[async_trait]
impl RouteFilter for RemoveHeaderFilter {
    async fn apply(&self, request: &mut ProxyRequest) -> GatewayResult<FilterOutcome> {
        request.headers.remove(self.name.as_str());
        Ok(FilterOutcome::Continue)
    }

    fn name(&self) -> &'static str {
        "remove_header"
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limit keyed by client address
///
/// `limit` tokens refill evenly over `window`; a request costs one token.
/// Exhausted buckets fail the request with RateLimitExceeded (429 at the
/// boundary).
pub struct RateLimitFilter {
    limit: u32,
    window: Duration,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimitFilter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    fn try_acquire(&self, key: &str) -> bool {
        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.limit as f64,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = bucket.lock();

        let refill_rate = self.limit as f64 / self.window.as_secs_f64();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(self.limit as f64);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl RouteFilter for RateLimitFilter {
    async fn apply(&self, request: &mut ProxyRequest) -> GatewayResult<FilterOutcome> {
        let key = request.client_key();
        if self.try_acquire(&key) {
            Ok(FilterOutcome::Continue)
        } else {
            warn!(client = %key, limit = self.limit, "Rate limit exceeded");
            metrics::counter!("gateway_rate_limited_requests").increment(1);
            Err(GatewayError::RateLimitExceeded {
                limit: self.limit,
                window: humantime::format_duration(self.window).to_string(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}

/// Compile filter definitions into the shared filter chain for one route
pub fn build_filters(definitions: &[FilterDefinition]) -> Vec<Arc<dyn RouteFilter>> {
    definitions
        .iter()
        .map(|definition| -> Arc<dyn RouteFilter> {
            match definition {
                FilterDefinition::SetHeader { name, value } => Arc::new(SetHeaderFilter {
                    name: name.clone(),
                    value: value.clone(),
                }),
                FilterDefinition::RemoveHeader { name } => Arc::new(RemoveHeaderFilter {
                    name: name.clone(),
                }),
                FilterDefinition::RateLimit { limit, window } => {
                    Arc::new(RateLimitFilter::new(*limit, *window))
                }
            }
        })
        .collect()
}

/// Run a filter chain to completion
pub async fn apply_chain(
    filters: &[Arc<dyn RouteFilter>],
    request: &mut ProxyRequest,
) -> GatewayResult<Option<GatewayResponse>> {
    for filter in filters {
        match filter.apply(request).await? {
            FilterOutcome::Continue => {
                debug!(filter = filter.name(), "Filter passed");
            }
            FilterOutcome::ShortCircuit(response) => {
                debug!(filter = filter.name(), "Filter short-circuited");
                return Ok(Some(response));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path: "/license/1".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        }
    }

    #[tokio::test]
    async fn test_set_header_overwrites() {
        let filters = build_filters(&[FilterDefinition::SetHeader {
            name: "x-gateway".to_string(),
            value: "msa".to_string(),
        }]);
        let mut req = request();
        req.headers.insert("x-gateway", "old".parse().unwrap());

        let outcome = apply_chain(&filters, &mut req).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(req.headers.get("x-gateway").unwrap(), "msa");
    }

    #[tokio::test]
    async fn test_remove_header() {
        let filters = build_filters(&[FilterDefinition::RemoveHeader {
            name: "authorization".to_string(),
        }]);
        let mut req = request();
        req.headers
            .insert("authorization", "Bearer x".parse().unwrap());

        apply_chain(&filters, &mut req).await.unwrap();
        assert!(req.headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_and_refills() {
        let filter = RateLimitFilter::new(2, Duration::from_millis(100));
        let mut req = request();

        assert!(matches!(
            filter.apply(&mut req).await.unwrap(),
            FilterOutcome::Continue
        ));
        assert!(matches!(
            filter.apply(&mut req).await.unwrap(),
            FilterOutcome::Continue
        ));
        assert!(matches!(
            filter.apply(&mut req).await.unwrap_err(),
            GatewayError::RateLimitExceeded { .. }
        ));

        // A full window later the bucket is refilled.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            filter.apply(&mut req).await.unwrap(),
            FilterOutcome::Continue
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_client() {
        let filter = RateLimitFilter::new(1, Duration::from_secs(60));

        let mut first = request();
        let mut second = request();
        second.client_addr = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        assert!(filter.apply(&mut first).await.is_ok());
        assert!(filter.apply(&mut first).await.is_err());
        // A different client has its own bucket.
        assert!(filter.apply(&mut second).await.is_ok());
    }

    #[tokio::test]
    async fn test_chain_runs_in_declared_order() {
        let filters = build_filters(&[
            FilterDefinition::SetHeader {
                name: "x-step".to_string(),
                value: "one".to_string(),
            },
            FilterDefinition::SetHeader {
                name: "x-step".to_string(),
                value: "two".to_string(),
            },
        ]);
        let mut req = request();

        apply_chain(&filters, &mut req).await.unwrap();
        assert_eq!(req.headers.get("x-step").unwrap(), "two");
    }
}
