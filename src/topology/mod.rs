//! Cluster topology model
//!
//! A [`ClusterTopology`] is the value every engine stage works on: services
//! keyed by (ServiceID, Version), the directed dependency edges between them,
//! and the ingresses that expose them. Topologies are plain owned values;
//! cloning one yields a fully independent copy.
//!
//! Multiple versions of one logical service coexist in merged topologies, so
//! a ServiceID alone is not a unique key. Lookups by ServiceID return the
//! first declared entry.

mod base;

pub use base::{generate_base_topology, parse_manifests, IngressConfig, ServiceConfig};

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::k8s::{self, DeploymentSpec, IngressRule, ServicePort, ServiceSpec};
use crate::{Error, Result};

/// Application protocol value that selects HTTP routing
pub const APP_PROTOCOL_HTTP: &str = "HTTP";

// =============================================================================
// Service
// =============================================================================

/// One version of a logical service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Logical service identity
    pub service_id: String,
    /// Version tag: the base version or a flow id
    pub version: String,
    /// Network-facing spec (ports, selector)
    pub service_spec: ServiceSpec,
    /// Workload (pod template); absent for external services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_spec: Option<DeploymentSpec>,
    /// Third-party dependency with no workload in the cluster
    #[serde(default)]
    pub is_external: bool,
    /// Carries data that must not be shared across versions
    #[serde(default)]
    pub is_stateful: bool,
    /// Plugins invoked when the service is forked
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_plugins: Vec<StatefulPlugin>,
}

impl Service {
    /// Whether the first declared port speaks HTTP
    pub fn is_http(&self) -> bool {
        k8s::ports(&self.service_spec)
            .first()
            .and_then(|p| p.app_protocol.as_deref())
            == Some(APP_PROTOCOL_HTTP)
    }

    /// Terminates a stateful path
    pub fn is_stateful_or_external(&self) -> bool {
        self.is_stateful || self.is_external
    }

    /// (ServiceID, Version) reference to this service
    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef::new(&self.service_id, &self.version)
    }

    /// Find a declared port by name
    pub fn port(&self, name: &str) -> Option<&ServicePort> {
        k8s::ports(&self.service_spec)
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
    }

    /// Check the external/workload/stateful flag invariants
    pub fn validate(&self) -> Result<()> {
        if self.is_external && self.workload_spec.is_some() {
            return Err(Error::structural(
                "validate topology",
                format!("external service '{}' must not have a workload", self.service_id),
            ));
        }
        if self.is_external && self.is_stateful {
            return Err(Error::structural(
                "validate topology",
                format!(
                    "service '{}' cannot be both external and stateful",
                    self.service_id
                ),
            ));
        }
        if !self.is_external && self.workload_spec.is_none() {
            return Err(Error::structural(
                "validate topology",
                format!("service '{}' has no workload", self.service_id),
            ));
        }
        Ok(())
    }
}

/// Reference to one version of a service
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    /// Logical service identity
    pub service_id: String,
    /// Version tag
    pub version: String,
}

impl ServiceRef {
    /// Create a reference
    pub fn new(service_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service_id, self.version)
    }
}

/// Directed edge: `service` depends on `depends_on`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDependency {
    /// Dependant
    pub service: ServiceRef,
    /// Dependency
    pub depends_on: ServiceRef,
    /// Port used on the dependency; absent for existence-only edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_port: Option<ServicePort>,
}

// =============================================================================
// Plugins
// =============================================================================

/// How a plugin participates in forking
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Provisions isolated state for a forked stateful service
    #[default]
    Stateful,
    /// Rewires the patched service to a forked external dependency
    External,
}

/// Reference to executable fork/teardown logic attached to a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulPlugin {
    /// Plugin reference (e.g. a repository URL)
    pub name: String,
    /// Owning service, or for external plugins the external service it forks
    #[serde(default)]
    pub service_name: String,
    /// Kind tag
    #[serde(default, rename = "type")]
    pub kind: PluginKind,
    /// Plugin arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

// =============================================================================
// Ingress
// =============================================================================

/// Ingress point and the flows currently routable through it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// Ingress identity; also the rendered gateway name
    pub ingress_id: String,
    /// Flow ids routable through this ingress
    #[serde(default)]
    pub active_flow_ids: Vec<String>,
    /// Host-based routing rules
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    /// Ingress class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
}

impl Ingress {
    /// First external host declared by the rules
    pub fn host(&self) -> Option<&str> {
        self.rules.iter().find_map(|r| r.host.as_deref())
    }

    /// Services targeted by the rules, in declaration order
    pub fn target_services(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for name in self.rules.iter().flat_map(k8s::backend_services) {
            if !targets.contains(&name) {
                targets.push(name);
            }
        }
        targets
    }

    /// Whether `service_id` is a target of this ingress
    pub fn targets(&self, service_id: &str) -> bool {
        self.rules
            .iter()
            .flat_map(k8s::backend_services)
            .any(|name| name == service_id)
    }
}

// =============================================================================
// ClusterTopology
// =============================================================================

/// Services, dependency edges and ingresses of one flow (or the base, or a merge)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Flow identifier
    pub flow_id: String,
    /// Namespace the topology was generated for
    #[serde(default)]
    pub namespace: String,
    /// Services keyed by (ServiceID, Version)
    #[serde(default)]
    pub services: Vec<Service>,
    /// Dependency edges
    #[serde(default)]
    pub service_dependencies: Vec<ServiceDependency>,
    /// Ingresses
    #[serde(default)]
    pub ingresses: Vec<Ingress>,
}

impl ClusterTopology {
    /// First service with the given id
    pub fn get_service(&self, service_id: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.service_id == service_id)
            .ok_or_else(|| Error::not_found("service", service_id, "topology lookup"))
    }

    /// Service with the given id and version
    pub fn get_service_version(&self, service_ref: &ServiceRef) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.service_id == service_ref.service_id && s.version == service_ref.version)
    }

    /// Service and one of its named ports
    pub fn get_service_and_port(
        &self,
        service_id: &str,
        port_name: &str,
    ) -> Result<(&Service, &ServicePort)> {
        let service = self.get_service(service_id)?;
        let port = service.port(port_name).ok_or_else(|| {
            Error::not_found(
                "port",
                format!("{service_id}:{port_name}"),
                "topology lookup",
            )
        })?;
        Ok((service, port))
    }

    /// Ingress whose rules target the given service
    pub fn ingress_for_service(&self, service_id: &str) -> Option<&Ingress> {
        self.ingresses.iter().find(|i| i.targets(service_id))
    }

    /// Distinct service ids in declaration order
    pub fn service_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.services
            .iter()
            .map(|s| s.service_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Check structural invariants: flag consistency, unique (id, version)
    /// pairs, unique edges, and edge endpoints present
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !keys.insert(service.service_ref()) {
                return Err(Error::structural(
                    "validate topology",
                    format!("duplicate service {}", service.service_ref()),
                ));
            }
        }

        for (idx, dep) in self.service_dependencies.iter().enumerate() {
            for endpoint in [&dep.service, &dep.depends_on] {
                if !keys.contains(endpoint) {
                    return Err(Error::structural(
                        "validate topology",
                        format!("dependency endpoint {endpoint} is not a service"),
                    ));
                }
            }
            if self.service_dependencies[..idx].contains(dep) {
                return Err(Error::structural(
                    "validate topology",
                    format!(
                        "duplicate dependency {} -> {}",
                        dep.service, dep.depends_on
                    ),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// FlowPatch
// =============================================================================

/// Replacement image and env for one service in a flow
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    /// Service to patch
    pub service: String,
    /// Replacement image for the first container
    pub image: String,
    /// Env vars upserted on the first container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_overrides: BTreeMap<String, String>,
}

impl ServicePatch {
    /// Apply the image and env overrides to a workload
    pub fn apply_to(&self, workload: &mut DeploymentSpec) -> Result<()> {
        let container = k8s::primary_container_mut(workload).ok_or_else(|| {
            Error::structural(
                "patch service",
                format!("workload of '{}' has no containers", self.service),
            )
        })?;
        container.image = Some(self.image.clone());
        for (name, value) in &self.env_overrides {
            k8s::upsert_env(container, name, value);
        }
        Ok(())
    }
}

/// A flow identifier plus the services it patches
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPatch {
    /// Flow identifier; becomes the version of every forked service
    pub flow_id: String,
    /// Patched services
    pub service_patches: Vec<ServicePatch>,
}

impl FlowPatch {
    /// Patch a single service image
    pub fn single(
        flow_id: impl Into<String>,
        service: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            service_patches: vec![ServicePatch {
                service: service.into(),
                image: image.into(),
                env_overrides: BTreeMap::new(),
            }],
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures::{boutique, http_service, tcp_service};
    use super::*;

    #[test]
    fn http_detection_uses_first_port() {
        assert!(http_service("frontend", "prod").is_http());
        assert!(!tcp_service("redis", "prod", true).is_http());
    }

    #[test]
    fn get_service_not_found_names_identity() {
        let topo = boutique();
        let err = topo.get_service("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound { ref id, .. } if id == "nope"));
    }

    #[test]
    fn get_service_and_port_resolves_named_port() {
        let topo = boutique();
        let (svc, port) = topo.get_service_and_port("redis-cart", "tcp-redis").unwrap();
        assert_eq!(svc.service_id, "redis-cart");
        assert_eq!(port.port, 6379);
        assert!(topo.get_service_and_port("redis-cart", "http").is_err());
    }

    #[test]
    fn boutique_fixture_is_valid() {
        boutique().validate().unwrap();
    }

    #[test]
    fn validate_rejects_external_with_workload() {
        let mut topo = boutique();
        let svc = topo
            .services
            .iter_mut()
            .find(|s| s.service_id == "paymentservice")
            .unwrap();
        svc.is_external = true;
        svc.is_stateful = false;
        assert!(matches!(
            topo.validate(),
            Err(Error::Structural { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_edges() {
        let mut topo = boutique();
        let dup = topo.service_dependencies[0].clone();
        topo.service_dependencies.push(dup);
        let err = topo.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate dependency"));
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let mut topo = boutique();
        topo.service_dependencies[0].depends_on = ServiceRef::new("ghost", "prod");
        assert!(topo.validate().is_err());
    }

    #[test]
    fn ingress_lookup_by_target() {
        let topo = boutique();
        let ingress = topo.ingress_for_service("frontend").unwrap();
        assert_eq!(ingress.host(), Some("web.example.com"));
        assert!(topo.ingress_for_service("cartservice").is_none());
    }

    #[test]
    fn patch_replaces_image_and_env() {
        let mut workload = http_service("frontend", "prod").workload_spec.unwrap();
        let mut patch = FlowPatch::single("dev-1", "frontend", "frontend:dev").service_patches[0].clone();
        patch
            .env_overrides
            .insert("LOG_LEVEL".to_string(), "debug".to_string());
        patch.apply_to(&mut workload).unwrap();
        assert_eq!(k8s::primary_image(&workload), Some("frontend:dev"));
        let container = &workload.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.env.as_ref().unwrap()[0].value.as_deref(),
            Some("debug")
        );
    }

    #[test]
    fn patch_without_containers_is_structural() {
        let mut workload = DeploymentSpec::default();
        let patch = FlowPatch::single("dev-1", "frontend", "frontend:dev");
        assert!(matches!(
            patch.service_patches[0].apply_to(&mut workload),
            Err(Error::Structural { .. })
        ));
    }

    #[test]
    fn plugin_kind_parses_type_tag() {
        let plugin: StatefulPlugin = serde_yaml::from_str(
            "name: github.com/example/stripe-plugin\ntype: external\nserviceName: stripe\nargs:\n  key: v\n",
        )
        .unwrap();
        assert_eq!(plugin.kind, PluginKind::External);
        assert_eq!(plugin.service_name, "stripe");
    }
}
