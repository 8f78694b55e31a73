//! Engine configuration
//!
//! Every field has a default, so an empty YAML document is a valid config.
//! The binary loads the file named by `--config` / `DEVFLOW_CONFIG` and lets
//! CLI flags override individual values.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Version label of the base (production) topology
pub const DEFAULT_BASE_VERSION: &str = "prod";
/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";
/// Trace router service host
pub const DEFAULT_TRACE_ROUTER_HOST: &str = "trace-router.default.svc.cluster.local";
/// Trace router service port
pub const DEFAULT_TRACE_ROUTER_PORT: u16 = 8080;
/// Trace router side-call timeout in milliseconds
pub const DEFAULT_TRACE_ROUTER_TIMEOUT_MS: u64 = 5000;
/// Namespace of the ingress gateway workload
pub const DEFAULT_GATEWAY_NAMESPACE: &str = "istio-system";

/// Top-level engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Version label of the base topology; also the trace routing fallback
    pub base_version: String,
    /// Namespace resources are rendered into
    pub namespace: String,
    /// Replica count of every rendered Deployment
    pub default_replicas: i32,
    /// Annotate pod templates for Istio sidecar injection
    pub sidecar_injection: bool,
    /// Timeout for a single plugin hook call, in seconds
    pub plugin_timeout_secs: u64,
    /// Ingress gateway settings
    pub gateway: GatewayConfig,
    /// Trace router settings
    pub trace_router: TraceRouterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_version: DEFAULT_BASE_VERSION.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_replicas: 1,
            sidecar_injection: true,
            plugin_timeout_secs: 60,
            gateway: GatewayConfig::default(),
            trace_router: TraceRouterConfig::default(),
        }
    }
}

/// Ingress gateway settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Labels selecting the gateway workload
    pub selector: BTreeMap<String, String>,
    /// Listener port
    pub port: u16,
    /// Namespace of the gateway workload (where its EnvoyFilter goes)
    pub namespace: String,
    /// Name of the gateway tracing EnvoyFilter
    pub filter_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
            port: 80,
            namespace: DEFAULT_GATEWAY_NAMESPACE.to_string(),
            filter_name: "kardinal-gateway-tracing".to_string(),
        }
    }
}

/// Trace router settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceRouterConfig {
    /// Service host
    pub host: String,
    /// Service port
    pub port: u16,
    /// Side-call timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TraceRouterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_TRACE_ROUTER_HOST.to_string(),
            port: DEFAULT_TRACE_ROUTER_PORT,
            timeout_ms: DEFAULT_TRACE_ROUTER_TIMEOUT_MS,
        }
    }
}

impl TraceRouterConfig {
    /// Envoy outbound cluster name of the trace router
    pub fn cluster(&self) -> String {
        format!("outbound|{}||{}", self.port, self.host)
    }

    /// Side-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// Plugin hook timeout
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    /// Reject values the renderer cannot use
    pub fn validate(&self) -> Result<()> {
        if self.base_version.is_empty() {
            return Err(Error::config("baseVersion must not be empty"));
        }
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.default_replicas < 1 {
            return Err(Error::config("defaultReplicas must be at least 1"));
        }
        if self.plugin_timeout_secs == 0 {
            return Err(Error::config("pluginTimeoutSecs must be positive"));
        }
        if self.gateway.port == 0 || self.trace_router.port == 0 {
            return Err(Error::config("ports must be non-zero"));
        }
        if self.gateway.selector.is_empty() {
            return Err(Error::config("gateway.selector must not be empty"));
        }
        if self.trace_router.host.is_empty() {
            return Err(Error::config("traceRouter.host must not be empty"));
        }
        if self.trace_router.timeout_ms == 0 {
            return Err(Error::config("traceRouter.timeoutMs must be positive"));
        }
        Ok(())
    }
}
