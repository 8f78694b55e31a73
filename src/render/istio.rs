//! Istio networking types
//!
//! Types for generating Istio networking/v1alpha3 resources:
//! - VirtualService: per-request HTTP routing and TCP forwarding
//! - DestinationRule: one subset per version label
//! - Gateway: ingress listener for flow hosts
//! - EnvoyFilter: Lua filters implementing trace-based sticky routing

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::k8s::{impl_api_defaults, HasApiResource, ObjectMeta};

/// API version shared by every networking resource rendered here
pub const ISTIO_NETWORKING_API_VERSION: &str = "networking.istio.io/v1alpha3";

// =============================================================================
// VirtualService
// =============================================================================

/// Istio VirtualService
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualService {
    /// API version
    #[serde(default = "VirtualService::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "VirtualService::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VirtualServiceSpec,
}

impl HasApiResource for VirtualService {
    const API_VERSION: &'static str = ISTIO_NETWORKING_API_VERSION;
    const KIND: &'static str = "VirtualService";
}

impl_api_defaults!(VirtualService);

impl VirtualService {
    /// Create a new VirtualService
    pub fn new(metadata: ObjectMeta, spec: VirtualServiceSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// VirtualService spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    /// Hosts the routes apply to
    pub hosts: Vec<String>,
    /// Gateways the routes are bound to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    /// HTTP routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
    /// TCP routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp: Vec<TcpRoute>,
}

/// HTTP route
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    /// Match conditions (OR-ed)
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<HttpMatchRequest>,
    /// Destinations
    pub route: Vec<RouteDestination>,
}

/// HTTP match conditions (AND-ed)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    /// Header matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,
}

impl HttpMatchRequest {
    /// Match a header value exactly
    pub fn header_exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            headers: BTreeMap::from([(name.into(), StringMatch::exact(value))]),
        }
    }
}

/// String match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    /// Exact value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    /// Prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl StringMatch {
    /// Exact match
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            exact: Some(value.into()),
            prefix: None,
        }
    }
}

/// TCP route
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpRoute {
    /// L4 match conditions
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<L4MatchAttributes>,
    /// Destinations
    pub route: Vec<RouteDestination>,
}

/// L4 match conditions
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L4MatchAttributes {
    /// Destination port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Weighted destination
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteDestination {
    /// Destination
    pub destination: Destination,
    /// Weight (percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Destination service (and subset)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Service host
    pub host: String,
    /// Subset name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    /// Port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

/// Port selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    /// Port number
    pub number: u16,
}

// =============================================================================
// DestinationRule
// =============================================================================

/// Istio DestinationRule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRule {
    /// API version
    #[serde(default = "DestinationRule::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "DestinationRule::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DestinationRuleSpec,
}

impl HasApiResource for DestinationRule {
    const API_VERSION: &'static str = ISTIO_NETWORKING_API_VERSION;
    const KIND: &'static str = "DestinationRule";
}

impl_api_defaults!(DestinationRule);

impl DestinationRule {
    /// Create a new DestinationRule
    pub fn new(metadata: ObjectMeta, spec: DestinationRuleSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// DestinationRule spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRuleSpec {
    /// Service host
    pub host: String,
    /// Subsets
    pub subsets: Vec<Subset>,
}

/// Named, label-selected group of endpoints
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subset {
    /// Subset name
    pub name: String,
    /// Endpoint labels
    pub labels: BTreeMap<String, String>,
    /// Traffic policy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,
}

/// Traffic policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicy {
    /// Client TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsSettings>,
}

/// Client TLS settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsSettings {
    /// Mode: DISABLE, SIMPLE, MUTUAL, ISTIO_MUTUAL
    pub mode: String,
}

// =============================================================================
// Gateway
// =============================================================================

/// Istio Gateway
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    /// API version
    #[serde(default = "Gateway::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Gateway::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: GatewaySpec,
}

impl HasApiResource for Gateway {
    const API_VERSION: &'static str = ISTIO_NETWORKING_API_VERSION;
    const KIND: &'static str = "Gateway";
}

impl_api_defaults!(Gateway);

impl Gateway {
    /// Create a new Gateway
    pub fn new(metadata: ObjectMeta, spec: GatewaySpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Gateway spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Labels selecting the gateway workload
    pub selector: BTreeMap<String, String>,
    /// Listeners
    pub servers: Vec<Server>,
}

/// Gateway listener
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Listener port
    pub port: GatewayPort,
    /// Hosts served
    pub hosts: Vec<String>,
}

/// Gateway listener port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPort {
    /// Port number
    pub number: u16,
    /// Port name
    pub name: String,
    /// Protocol
    pub protocol: String,
}

// =============================================================================
// EnvoyFilter
// =============================================================================

/// Istio EnvoyFilter
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilter {
    /// API version
    #[serde(default = "EnvoyFilter::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "EnvoyFilter::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: EnvoyFilterSpec,
}

impl HasApiResource for EnvoyFilter {
    const API_VERSION: &'static str = ISTIO_NETWORKING_API_VERSION;
    const KIND: &'static str = "EnvoyFilter";
}

impl_api_defaults!(EnvoyFilter);

impl EnvoyFilter {
    /// Create a new EnvoyFilter
    pub fn new(metadata: ObjectMeta, spec: EnvoyFilterSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// EnvoyFilter spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilterSpec {
    /// Workloads the filter applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<WorkloadSelector>,
    /// Config patches
    pub config_patches: Vec<EnvoyConfigObjectPatch>,
}

/// Workload selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// A single patch to Envoy configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigObjectPatch {
    /// Config object kind: HTTP_FILTER, LISTENER, ...
    pub apply_to: String,
    /// Where to apply
    #[serde(rename = "match")]
    pub match_: EnvoyConfigObjectMatch,
    /// What to apply
    pub patch: EnvoyPatch,
}

/// Patch location
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigObjectMatch {
    /// SIDECAR_INBOUND, SIDECAR_OUTBOUND or GATEWAY
    pub context: String,
    /// Listener match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerMatch>,
}

/// Listener match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerMatch {
    /// Filter chain match
    pub filter_chain: FilterChainMatch,
}

/// Filter chain match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterChainMatch {
    /// Network filter match
    pub filter: FilterMatch,
}

/// Network filter match
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    /// Filter name
    pub name: String,
}

/// Patch operation and value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyPatch {
    /// Operation: INSERT_BEFORE, MERGE, ...
    pub operation: String,
    /// Envoy config fragment
    pub value: serde_json::Value,
}
