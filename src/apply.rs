//! Applying rendered resources to a cluster
//!
//! The applier itself is a collaborator behind [`ClusterApplier`]; this module
//! decides what to apply, in which order, and what to prune. Every call is
//! keyed by kind, namespace and name, so a reconcile loop can repeat
//! [`apply_cluster_resources`] without duplicating anything.

use std::collections::BTreeSet;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info};

use k8s_openapi::Resource;

use crate::k8s::{self, Deployment, HasApiResource, Service};
use crate::render::istio::{DestinationRule, EnvoyFilter, Gateway, VirtualService};
use crate::render::ClusterResources;
use crate::Result;

/// Any resource the renderer produces
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClusterResource {
    /// Kubernetes Service
    Service(Service),
    /// Kubernetes Deployment
    Deployment(Deployment),
    /// Istio DestinationRule
    DestinationRule(DestinationRule),
    /// Istio VirtualService
    VirtualService(VirtualService),
    /// Istio Gateway
    Gateway(Gateway),
    /// Istio EnvoyFilter
    EnvoyFilter(EnvoyFilter),
}

/// Identity of a resource in a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource kind
    pub kind: &'static str,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl ClusterResource {
    /// Resource kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => <Service as Resource>::KIND,
            Self::Deployment(_) => <Deployment as Resource>::KIND,
            Self::DestinationRule(_) => DestinationRule::KIND,
            Self::VirtualService(_) => VirtualService::KIND,
            Self::Gateway(_) => Gateway::KIND,
            Self::EnvoyFilter(_) => EnvoyFilter::KIND,
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        match self {
            Self::Service(r) => k8s::name_of(&r.metadata),
            Self::Deployment(r) => k8s::name_of(&r.metadata),
            Self::DestinationRule(r) => &r.metadata.name,
            Self::VirtualService(r) => &r.metadata.name,
            Self::Gateway(r) => &r.metadata.name,
            Self::EnvoyFilter(r) => &r.metadata.name,
        }
    }

    /// Resource namespace
    pub fn namespace(&self) -> &str {
        match self {
            Self::Service(r) => r.metadata.namespace.as_deref().unwrap_or_default(),
            Self::Deployment(r) => r.metadata.namespace.as_deref().unwrap_or_default(),
            Self::DestinationRule(r) => &r.metadata.namespace,
            Self::VirtualService(r) => &r.metadata.namespace,
            Self::Gateway(r) => &r.metadata.namespace,
            Self::EnvoyFilter(r) => &r.metadata.namespace,
        }
    }

    /// Kind, namespace and name
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }
}

impl ClusterResources {
    /// All resources in apply order: Services, Deployments, DestinationRules,
    /// VirtualServices, Gateways, EnvoyFilters
    pub fn ordered(&self) -> Vec<ClusterResource> {
        let mut ordered = Vec::with_capacity(self.len());
        ordered.extend(self.services.iter().cloned().map(ClusterResource::Service));
        ordered.extend(self.deployments.iter().cloned().map(ClusterResource::Deployment));
        ordered.extend(
            self.destination_rules
                .iter()
                .cloned()
                .map(ClusterResource::DestinationRule),
        );
        ordered.extend(
            self.virtual_services
                .iter()
                .cloned()
                .map(ClusterResource::VirtualService),
        );
        ordered.extend(self.gateways.iter().cloned().map(ClusterResource::Gateway));
        ordered.extend(self.envoy_filters.iter().cloned().map(ClusterResource::EnvoyFilter));
        ordered
    }

    /// Multi-document YAML of every resource in apply order
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for resource in self.ordered() {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&resource)?);
        }
        Ok(out)
    }
}

/// Idempotent, namespace-scoped resource writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    /// Create the resource, or update it in place if it exists
    async fn create_or_update(&self, resource: &ClusterResource) -> Result<()>;

    /// Delete the resource; deleting an absent resource succeeds
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

/// Apply every resource in dependency order. Stops at the first failure.
///
/// Returns the number of resources applied.
pub async fn apply_cluster_resources(
    applier: &dyn ClusterApplier,
    resources: &ClusterResources,
) -> Result<usize> {
    let ordered = resources.ordered();
    for resource in &ordered {
        debug!(resource = %resource.key(), "applying resource");
        applier.create_or_update(resource).await?;
    }
    info!(count = ordered.len(), "applied cluster resources");
    Ok(ordered.len())
}

/// Delete resources of `previous` that `current` no longer contains.
///
/// Deletion runs in reverse apply order so routing goes before the workloads
/// it points at. Returns the number of resources deleted.
pub async fn prune_stale_resources(
    applier: &dyn ClusterApplier,
    previous: &ClusterResources,
    current: &ClusterResources,
) -> Result<usize> {
    let keep: BTreeSet<ResourceKey> = current.ordered().iter().map(ClusterResource::key).collect();
    let stale: Vec<ResourceKey> = previous
        .ordered()
        .iter()
        .rev()
        .map(ClusterResource::key)
        .filter(|key| !keep.contains(key))
        .collect();

    for key in &stale {
        debug!(resource = %key, "deleting stale resource");
        applier.delete(key).await?;
    }
    if !stale.is_empty() {
        info!(count = stale.len(), "pruned stale cluster resources");
    }
    Ok(stale.len())
}
