//! Route table and request matching.
//!
//! Routes are compiled once from configuration into an ordered table;
//! matching walks the table in declared order and the first route whose
//! predicates accept the request wins. The live table is swapped atomically
//! on config reload, so in-flight requests always see either the fully-old
//! or fully-new table.

use matchit::Router as PathMatcher;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::{GatewayConfig, RouteDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::filters::{build_filters, RouteFilter};

/// One compiled routing rule, immutable after load
pub struct Route {
    pub id: String,
    pub service: String,
    pub path_prefix: String,
    pub host: Option<String>,
    pub strip_prefix: bool,
    pub filters: Vec<Arc<dyn RouteFilter>>,
    matcher: PathMatcher<bool>,
}

impl Route {
    fn compile(definition: &RouteDefinition) -> GatewayResult<Self> {
        let prefix = definition.path_prefix.trim_end_matches('/');

        // The matcher value records whether the hit was the bare prefix
        // (true) or a descendant path (false).
        let mut matcher = PathMatcher::new();
        if prefix.is_empty() {
            matcher
                .insert("/", true)
                .and_then(|_| matcher.insert("/*rest", false))
                .map_err(|e| GatewayError::config(format!("route {}: {}", definition.id, e)))?;
        } else {
            matcher
                .insert(prefix, true)
                .and_then(|_| matcher.insert(format!("{}/*rest", prefix), false))
                .map_err(|e| GatewayError::config(format!("route {}: {}", definition.id, e)))?;
        }

        Ok(Self {
            id: definition.id.clone(),
            service: definition.service.clone(),
            path_prefix: if prefix.is_empty() { "/" } else { prefix }.to_string(),
            host: definition.host.clone(),
            strip_prefix: definition.strip_prefix,
            filters: build_filters(&definition.filters),
            matcher,
        })
    }

    /// Match a path against this route, producing the upstream path
    fn match_path(&self, path: &str) -> Option<String> {
        let matched = self.matcher.at(path).ok()?;
        let upstream = if self.strip_prefix {
            if *matched.value {
                "/".to_string()
            } else {
                format!("/{}", matched.params.get("rest").unwrap_or(""))
            }
        } else {
            path.to_string()
        };
        Some(upstream)
    }

    /// Match the host predicate, if this route has one
    fn match_host(&self, request_host: Option<&str>) -> bool {
        match &self.host {
            None => true,
            Some(expected) => request_host
                .map(|h| h.split(':').next().unwrap_or(h))
                .map(|h| h.eq_ignore_ascii_case(expected))
                .unwrap_or(false),
        }
    }
}

/// A successful route match
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Path to send upstream (prefix stripped when the route says so)
    pub upstream_path: String,
}

/// Ordered, immutable set of compiled routes
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile the route table from configuration
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let routes = config
            .routes
            .iter()
            .map(|definition| Route::compile(definition).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;

        info!(route_count = routes.len(), "Route table compiled");
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route accepting both the path and the host header wins
    pub fn match_route(&self, path: &str, host: Option<&str>) -> GatewayResult<RouteMatch> {
        for route in &self.routes {
            if !route.match_host(host) {
                continue;
            }
            if let Some(upstream_path) = route.match_path(path) {
                debug!(route_id = %route.id, path, %upstream_path, "Route matched");
                return Ok(RouteMatch {
                    route: Arc::clone(route),
                    upstream_path,
                });
            }
        }
        Err(GatewayError::NoRouteFound {
            path: path.to_string(),
        })
    }
}

/// Shared handle to the live route table
///
/// Readers clone the current `Arc` under a short read lock; a reload builds
/// the new table off to the side and swaps the pointer.
pub struct RouterHandle {
    table: parking_lot::RwLock<Arc<RouteTable>>,
}

impl RouterHandle {
    pub fn new(table: RouteTable) -> Self {
        Self {
            table: parking_lot::RwLock::new(Arc::new(table)),
        }
    }

    /// Snapshot of the current table
    pub fn current(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table.read())
    }

    /// Replace the live table atomically
    pub fn swap(&self, table: RouteTable) {
        let table = Arc::new(table);
        *self.table.write() = table;
        info!("Route table swapped");
        metrics::counter!("gateway_route_table_reloads").increment(1);
    }

    /// Match a request against the current table
    pub fn match_route(&self, path: &str, host: Option<&str>) -> GatewayResult<RouteMatch> {
        self.current().match_route(path, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(yaml: &str) -> RouteTable {
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        RouteTable::from_config(&config).unwrap()
    }

    const TWO_ROUTES: &str = r#"
routes:
  - id: license
    path_prefix: /license
    service: license
  - id: firm
    path_prefix: /firm
    service: firm
    strip_prefix: true
"#;

    #[test]
    fn test_prefix_match_preserves_path() {
        let table = table(TWO_ROUTES);

        let matched = table.match_route("/license/v1/license/42", None).unwrap();
        assert_eq!(matched.route.id, "license");
        assert_eq!(matched.upstream_path, "/license/v1/license/42");
    }

    #[test]
    fn test_strip_prefix_rewrites_upstream_path() {
        let table = table(TWO_ROUTES);

        let matched = table.match_route("/firm/v1/firm/7", None).unwrap();
        assert_eq!(matched.route.id, "firm");
        assert_eq!(matched.upstream_path, "/v1/firm/7");

        // Bare prefix collapses to the upstream root.
        let bare = table.match_route("/firm", None).unwrap();
        assert_eq!(bare.upstream_path, "/");
    }

    #[test]
    fn test_unmatched_path_is_no_route() {
        let table = table(TWO_ROUTES);

        let err = table.match_route("/billing/v1/invoices", None).err();
        assert!(matches!(err, Some(GatewayError::NoRouteFound { .. })));
    }

    #[test]
    fn test_first_match_wins_in_declared_order() {
        let table = table(
            r#"
routes:
  - id: specific
    path_prefix: /license
    service: license-v2
  - id: catch-all
    path_prefix: /
    service: legacy
"#,
        );

        assert_eq!(
            table.match_route("/license/1", None).unwrap().route.id,
            "specific"
        );
        assert_eq!(
            table.match_route("/anything", None).unwrap().route.id,
            "catch-all"
        );
    }

    #[test]
    fn test_host_predicate() {
        let table = table(
            r#"
routes:
  - id: partner
    path_prefix: /license
    host: partner.example.com
    service: partner-license
  - id: default
    path_prefix: /license
    service: license
"#,
        );

        let partner = table
            .match_route("/license/1", Some("partner.example.com:443"))
            .unwrap();
        assert_eq!(partner.route.id, "partner");

        let public = table.match_route("/license/1", Some("api.example.com")).unwrap();
        assert_eq!(public.route.id, "default");

        // No host header only matches host-free routes.
        let bare = table.match_route("/license/1", None).unwrap();
        assert_eq!(bare.route.id, "default");
    }

    #[test]
    fn test_handle_swap_is_atomic_for_readers() {
        let handle = RouterHandle::new(table(TWO_ROUTES));
        let before = handle.current();

        handle.swap(table(
            r#"
routes:
  - id: only-firm
    path_prefix: /firm
    service: firm
"#,
        ));

        // The old snapshot still answers consistently.
        assert!(before.match_route("/license/1", None).is_ok());
        // New lookups see only the new table.
        assert!(handle.match_route("/license/1", None).is_err());
        assert!(handle.match_route("/firm/1", None).is_ok());
    }
}
