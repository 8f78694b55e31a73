//! Base topology generation from annotated Kubernetes manifests
//!
//! Services opt into engine semantics through `kardinal.dev.service/*`
//! annotations:
//!
//! | Annotation | Value |
//! |---|---|
//! | `stateful` | `"true"` marks the service stateful |
//! | `external` | `"true"` marks a third-party dependency (no deployment) |
//! | `plugins` | YAML list of [`StatefulPlugin`] entries |
//! | `dependencies` | `"svc:portName,svc:portName"` |

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::k8s::{self, LABEL_APP};
use crate::{Error, Result};

use super::{ClusterTopology, Ingress, Service, ServiceDependency, StatefulPlugin};

/// Annotation prefix for engine metadata
pub const ANNOTATION_PREFIX: &str = "kardinal.dev.service/";
/// Marks a stateful service
pub const ANNOTATION_STATEFUL: &str = "kardinal.dev.service/stateful";
/// Marks an external service
pub const ANNOTATION_EXTERNAL: &str = "kardinal.dev.service/external";
/// YAML list of plugins
pub const ANNOTATION_PLUGINS: &str = "kardinal.dev.service/plugins";
/// Comma-separated `service:port` dependency list
pub const ANNOTATION_DEPENDENCIES: &str = "kardinal.dev.service/dependencies";

const OPERATION: &str = "generate base topology";

/// A Service manifest plus the Deployment backing it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service manifest
    pub service: k8s::Service,
    /// Deployment manifest; absent for external services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<k8s::Deployment>,
}

/// An Ingress manifest
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Ingress manifest
    pub ingress: k8s::Ingress,
}

fn annotation_is_true(meta: &k8s::KubeObjectMeta, key: &str) -> bool {
    k8s::annotation(meta, key) == Some("true")
}

/// Build the base topology for a namespace from service and ingress manifests.
///
/// Every service and ingress is stamped with `version`. Dependencies are
/// resolved against the declared services and their named ports.
pub fn generate_base_topology(
    service_configs: &[ServiceConfig],
    ingress_configs: &[IngressConfig],
    version: &str,
    namespace: &str,
) -> Result<ClusterTopology> {
    let mut topology = ClusterTopology {
        flow_id: version.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    };

    for config in service_configs {
        topology.services.push(service_from_config(config, version)?);
    }

    for config in service_configs {
        let meta = &config.service.metadata;
        let Some(raw) = k8s::annotation(meta, ANNOTATION_DEPENDENCIES) else {
            continue;
        };
        let name = k8s::name_of(meta);
        let service = topology.get_service(name)?.service_ref();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (dep_name, port_name) = entry.split_once(':').ok_or_else(|| {
                Error::structural(
                    OPERATION,
                    format!("dependency '{entry}' of '{name}' is not in service:port form"),
                )
            })?;
            let (dep_service, port) = topology.get_service_and_port(dep_name, port_name)?;
            let dependency = ServiceDependency {
                service: service.clone(),
                depends_on: dep_service.service_ref(),
                dependency_port: Some(port.clone()),
            };
            if topology.service_dependencies.contains(&dependency) {
                return Err(Error::structural(
                    OPERATION,
                    format!("'{name}' declares dependency '{entry}' twice"),
                ));
            }
            debug!(service = %name, depends_on = %dep_name, port = %port_name, "resolved dependency");
            topology.service_dependencies.push(dependency);
        }
    }

    for config in ingress_configs {
        let ingress = &config.ingress;
        topology.ingresses.push(Ingress {
            ingress_id: k8s::name_of(&ingress.metadata).to_string(),
            active_flow_ids: vec![version.to_string()],
            rules: k8s::ingress_rules(ingress).to_vec(),
            ingress_class_name: ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.ingress_class_name.clone()),
        });
    }

    topology.validate()?;

    info!(
        namespace = %namespace,
        version = %version,
        services = topology.services.len(),
        dependencies = topology.service_dependencies.len(),
        ingresses = topology.ingresses.len(),
        "generated base topology"
    );
    Ok(topology)
}

/// Service and ingress configs from a multi-document manifest stream.
///
/// Each Deployment is paired with the Service named by its pod `app` label,
/// or else by its own name. Documents of other kinds are skipped.
pub fn parse_manifests(yaml: &str) -> Result<(Vec<ServiceConfig>, Vec<IngressConfig>)> {
    let mut services: Vec<k8s::Service> = Vec::new();
    let mut deployments: Vec<k8s::Deployment> = Vec::new();
    let mut ingresses: Vec<IngressConfig> = Vec::new();

    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        match value.get("kind").and_then(serde_yaml::Value::as_str) {
            Some("Service") => services.push(serde_yaml::from_value(value)?),
            Some("Deployment") => deployments.push(serde_yaml::from_value(value)?),
            Some("Ingress") => ingresses.push(IngressConfig {
                ingress: serde_yaml::from_value(value)?,
            }),
            other => debug!(kind = ?other, "skipping manifest"),
        }
    }

    let mut configs = Vec::with_capacity(services.len());
    for service in services {
        let name = k8s::name_of(&service.metadata);
        let deployment = deployments
            .iter()
            .position(|d| pod_app_label(d) == Some(name) || d.metadata.name.as_deref() == Some(name))
            .map(|idx| deployments.remove(idx));
        configs.push(ServiceConfig {
            service,
            deployment,
        });
    }
    for orphan in &deployments {
        warn!(deployment = %k8s::name_of(&orphan.metadata), "deployment matches no service");
    }

    Ok((configs, ingresses))
}

fn pod_app_label(deployment: &k8s::Deployment) -> Option<&str> {
    let template_meta = deployment.spec.as_ref()?.template.metadata.as_ref()?;
    k8s::label(template_meta, LABEL_APP)
}

fn service_from_config(config: &ServiceConfig, version: &str) -> Result<Service> {
    let meta = &config.service.metadata;
    let name = k8s::name_of(meta);
    if name.is_empty() {
        return Err(Error::structural(OPERATION, "service manifest has no name"));
    }

    let stateful_plugins = match k8s::annotation(meta, ANNOTATION_PLUGINS) {
        Some(raw) => serde_yaml::from_str::<Vec<StatefulPlugin>>(raw).map_err(|e| {
            Error::serialization(format!("plugins of service '{name}': {e}"))
        })?,
        None => Vec::new(),
    };

    Ok(Service {
        service_id: name.to_string(),
        version: version.to_string(),
        service_spec: config.service.spec.clone().unwrap_or_default(),
        workload_spec: config
            .deployment
            .as_ref()
            .map(|d| d.spec.clone().unwrap_or_default()),
        is_external: annotation_is_true(meta, ANNOTATION_EXTERNAL),
        is_stateful: annotation_is_true(meta, ANNOTATION_STATEFUL),
        stateful_plugins,
    })
}
