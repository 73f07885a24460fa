//! # Configuration Module
//!
//! Configuration management with hot reloading. The gateway loads a YAML
//! configuration tree at startup and a background task polls the backing
//! `ConfigSource` so the route table and breaker thresholds can be reloaded
//! without a restart. Reload consumers receive full `GatewayConfig` snapshots
//! over a broadcast channel; readers always observe either the fully-old or
//! fully-new configuration, never a partial mix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::core::error::{GatewayError, GatewayResult};

/// Selection policy used by the client-side load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    RoundRobin,
    Random,
    Weighted,
}

impl Default for BalancerPolicy {
    fn default() -> Self {
        BalancerPolicy::RoundRobin
    }
}

/// HTTP server settings for the gateway surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to bind the listener to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port for inbound traffic
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Instance registry and lease settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Expected heartbeat interval for registered instances
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Number of missed heartbeats before an instance is evicted
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// How often the lease sweep runs
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

impl RegistrySettings {
    /// Lease time-to-live derived from the heartbeat settings
    pub fn lease_ttl(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Circuit breaker thresholds, reloadable per config generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Size of the sliding outcome window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Failure fraction within the window that opens the circuit
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Minimum observed calls before the failure rate is evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    /// How long the circuit stays open before probing for recovery
    #[serde(with = "humantime_serde", default = "default_open_duration")]
    pub open_duration: Duration,

    /// Number of trial calls admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Successful trials needed to close the circuit again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_window_size() -> usize {
    20
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_calls: default_minimum_calls(),
            open_duration: default_open_duration(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Settings for outbound upstream calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Per-request timeout bounding worst-case latency
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
        }
    }
}

/// Declarative filter attached to a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterDefinition {
    /// Set (or overwrite) a request header before forwarding
    SetHeader { name: String, value: String },
    /// Remove a request header before forwarding
    RemoveHeader { name: String },
    /// Token-bucket rate limit keyed by client address
    RateLimit {
        limit: u32,
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
}

/// One routing rule: predicate, target service, and filter chain
///
/// Routes are immutable after load; a config reload replaces the whole table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Stable identifier for logs and breaker naming
    pub id: String,

    /// Path prefix predicate, e.g. `/license` matches `/license` and `/license/**`
    pub path_prefix: String,

    /// Optional exact host predicate
    #[serde(default)]
    pub host: Option<String>,

    /// Target service name resolved through the load balancer
    pub service: String,

    /// Strip the matched prefix before forwarding upstream
    #[serde(default)]
    pub strip_prefix: bool,

    /// Ordered filter chain applied before forwarding
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
}

/// Top-level gateway configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

/// Load balancer section of the configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub policy: BalancerPolicy,
}

impl GatewayConfig {
    /// Parse a configuration tree from a YAML document
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rebuild a configuration tree from flattened dotted properties
    ///
    /// Inverse of the `ConfigSource` key flattening: `server.port` and
    /// `routes[0].id` style keys are folded back into the nested tree before
    /// deserializing and validating.
    pub fn from_properties(props: &HashMap<String, String>) -> GatewayResult<Self> {
        let tree = unflatten(props);
        let config: GatewayConfig = serde_yaml::from_value(tree)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration from a YAML file
    pub async fn load_from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Validate invariants that serde cannot express
    pub fn validate(&self) -> GatewayResult<()> {
        if !(0.0..=1.0).contains(&self.breaker.failure_rate_threshold) {
            return Err(GatewayError::config(format!(
                "breaker.failure_rate_threshold must be within [0, 1], got {}",
                self.breaker.failure_rate_threshold
            )));
        }
        if self.breaker.window_size == 0 {
            return Err(GatewayError::config("breaker.window_size must be > 0"));
        }
        if self.registry.max_missed_heartbeats == 0 {
            return Err(GatewayError::config(
                "registry.max_missed_heartbeats must be > 0",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !route.path_prefix.starts_with('/') {
                return Err(GatewayError::config(format!(
                    "route {}: path_prefix must start with '/'",
                    route.id
                )));
            }
            if !seen.insert(&route.id) {
                return Err(GatewayError::config(format!(
                    "duplicate route id: {}",
                    route.id
                )));
            }
        }
        Ok(())
    }
}

/// External configuration provider interface
///
/// The config-server role of the deployment: given a service name and profile,
/// return that service's key-value configuration. The gateway polls this source
/// for its own (`gateway`) configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch key-value configuration for a service/profile pair
    async fn fetch_config(
        &self,
        service: &str,
        profile: &str,
    ) -> GatewayResult<HashMap<String, String>>;
}

/// File-backed config source reading `{service}-{profile}.yaml` (falling back
/// to `{service}.yaml`) from a directory, flattened to dotted keys
pub struct FileConfigSource {
    dir: PathBuf,
}

impl FileConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn flatten(prefix: &str, value: &serde_yaml::Value, out: &mut HashMap<String, String>) {
        match value {
            serde_yaml::Value::Mapping(map) => {
                for (k, v) in map {
                    if let Some(key) = k.as_str() {
                        let child = if prefix.is_empty() {
                            key.to_string()
                        } else {
                            format!("{}.{}", prefix, key)
                        };
                        Self::flatten(&child, v, out);
                    }
                }
            }
            serde_yaml::Value::Sequence(seq) => {
                for (i, v) in seq.iter().enumerate() {
                    Self::flatten(&format!("{}[{}]", prefix, i), v, out);
                }
            }
            serde_yaml::Value::Null => {}
            other => {
                let rendered = match other {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => return,
                };
                out.insert(prefix.to_string(), rendered);
            }
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch_config(
        &self,
        service: &str,
        profile: &str,
    ) -> GatewayResult<HashMap<String, String>> {
        let candidates = [
            self.dir.join(format!("{}-{}.yaml", service, profile)),
            self.dir.join(format!("{}.yaml", service)),
        ];

        for path in &candidates {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let value: serde_yaml::Value = serde_yaml::from_str(&content)?;
                    let mut out = HashMap::new();
                    Self::flatten("", &value, &mut out);
                    debug!(
                        service,
                        profile,
                        file = %path.display(),
                        keys = out.len(),
                        "Fetched configuration"
                    );
                    return Ok(out);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(GatewayError::config(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(GatewayError::config(format!(
            "no configuration found for service {} profile {}",
            service, profile
        )))
    }
}

/// Fold flattened dotted properties back into a YAML tree
fn unflatten(props: &HashMap<String, String>) -> serde_yaml::Value {
    let mut root = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    for (key, raw) in props {
        let segments: Vec<&str> = key.split('.').collect();
        set_path(&mut root, &segments, parse_scalar(raw));
    }
    root
}

/// Parse a flattened scalar back into the most specific YAML type
fn parse_scalar(raw: &str) -> serde_yaml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_yaml::Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_yaml::Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_yaml::Value::Number(serde_yaml::Number::from(f));
    }
    serde_yaml::Value::String(raw.to_string())
}

/// Split a key segment into its name and any `[i]` sequence indices
fn parse_segment(segment: &str) -> (&str, Vec<usize>) {
    let mut parts = segment.split('[');
    let name = parts.next().unwrap_or(segment);
    let indices = parts
        .filter_map(|p| p.strip_suffix(']'))
        .filter_map(|p| p.parse().ok())
        .collect();
    (name, indices)
}

fn as_mapping_mut(value: &mut serde_yaml::Value) -> &mut serde_yaml::Mapping {
    if !value.is_mapping() {
        *value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    match value {
        serde_yaml::Value::Mapping(map) => map,
        _ => unreachable!(),
    }
}

fn as_sequence_mut(value: &mut serde_yaml::Value) -> &mut serde_yaml::Sequence {
    if !value.is_sequence() {
        *value = serde_yaml::Value::Sequence(Vec::new());
    }
    match value {
        serde_yaml::Value::Sequence(seq) => seq,
        _ => unreachable!(),
    }
}

fn set_path(node: &mut serde_yaml::Value, segments: &[&str], leaf: serde_yaml::Value) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };
    let (name, indices) = parse_segment(segment);

    let map = as_mapping_mut(node);
    let mut slot = map
        .entry(serde_yaml::Value::String(name.to_string()))
        .or_insert(serde_yaml::Value::Null);
    for idx in indices {
        let seq = as_sequence_mut(slot);
        while seq.len() <= idx {
            seq.push(serde_yaml::Value::Null);
        }
        slot = &mut seq[idx];
    }

    if rest.is_empty() {
        *slot = leaf;
    } else {
        set_path(slot, rest, leaf);
    }
}

/// Configuration manager with atomic snapshot swapping and change fan-out
///
/// Pulls fresh configuration from a `ConfigSource`, holds the current
/// `Arc<GatewayConfig>` behind an RwLock, and broadcasts new snapshots to
/// subscribers (the gateway swaps its route table on receipt).
pub struct ConfigManager {
    current: parking_lot::RwLock<Arc<GatewayConfig>>,
    changes: broadcast::Sender<Arc<GatewayConfig>>,
    source: Box<dyn ConfigSource>,
    service: String,
    profile: String,
}

impl ConfigManager {
    /// Create a manager pulling from the given source
    pub fn new(
        config: GatewayConfig,
        source: Box<dyn ConfigSource>,
        service: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            current: parking_lot::RwLock::new(Arc::new(config)),
            changes,
            source,
            service: service.into(),
            profile: profile.into(),
        }
    }

    /// Create a manager backed by the directory of the given config file
    ///
    /// The file stem becomes the service name, so `config/gateway.yaml` is
    /// served by a `FileConfigSource` over `config/` as service `gateway`.
    pub fn from_file(config: GatewayConfig, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or(Path::new("."));
        let service = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("gateway")
            .to_string();
        Self::new(
            config,
            Box::new(FileConfigSource::new(dir)),
            service,
            "default",
        )
    }

    /// Current configuration snapshot
    pub fn current(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.current.read())
    }

    /// Subscribe to configuration reloads
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayConfig>> {
        self.changes.subscribe()
    }

    /// Pull from the source; swaps and broadcasts only when the fetched
    /// configuration parses, validates, and actually changed
    pub async fn reload(&self) -> GatewayResult<bool> {
        let props = self
            .source
            .fetch_config(&self.service, &self.profile)
            .await?;
        let fresh = GatewayConfig::from_properties(&props)?;

        let changed = {
            let current = self.current.read();
            serde_yaml::to_string(&fresh).ok() != serde_yaml::to_string(current.as_ref()).ok()
        };
        if !changed {
            return Ok(false);
        }

        let snapshot = Arc::new(fresh);
        *self.current.write() = Arc::clone(&snapshot);
        let _ = self.changes.send(snapshot);
        info!(
            service = %self.service,
            profile = %self.profile,
            "Configuration reloaded"
        );
        Ok(true)
    }

    /// Spawn the polling reload task
    ///
    /// A bad file on disk keeps the last good snapshot; the failure is logged
    /// and the next poll tries again.
    pub fn spawn_reload_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match manager.reload().await {
                    Ok(true) => {}
                    Ok(false) => debug!("Configuration unchanged"),
                    Err(e) => {
                        error!(error = %e, "Configuration reload failed, keeping last good config");
                        metrics::counter!("config_reload_failures").increment(1);
                    }
                }
            }
        })
    }
}
