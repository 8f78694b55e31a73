//! Kubernetes Service and Deployment compilation

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::k8s::{
    self, Deployment, DeploymentStrategy, IntOrString, LabelSelector, RollingUpdateDeployment,
    Service, ServicePort, LABEL_APP, LABEL_VERSION,
};
use crate::topology;
use crate::{Error, Result};

/// Pod annotation enabling Istio sidecar injection
pub const SIDECAR_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

/// Compiles topology services into Kubernetes workload resources
pub struct WorkloadCompiler;

impl WorkloadCompiler {
    /// Deployment name for one version of a service
    pub fn deployment_name(service: &topology::Service) -> String {
        format!("{}-{}", service.service_id, service.version)
    }

    /// Labels identifying the pods of one version of a service
    pub fn version_labels(service: &topology::Service) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), service.service_id.clone()),
            (LABEL_VERSION.to_string(), service.version.clone()),
        ])
    }

    /// Network Service shared by all versions of a ServiceID.
    ///
    /// The selector matches on `app` only, so every version's pods back it and
    /// subsets pick the version. Every other declared field is kept.
    pub fn compile_service(service: &topology::Service, namespace: &str) -> Service {
        let mut spec = service.service_spec.clone();
        spec.selector = Some(BTreeMap::from([(
            LABEL_APP.to_string(),
            service.service_id.clone(),
        )]));

        let mut metadata = k8s::kube_meta(&service.service_id, namespace);
        metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_APP.to_string(), service.service_id.clone());
        Service {
            metadata,
            spec: Some(spec),
            ..Default::default()
        }
    }

    /// Deployment for one (ServiceID, Version). `None` for services without a workload.
    pub fn compile_deployment(
        service: &topology::Service,
        namespace: &str,
        config: &EngineConfig,
    ) -> Option<Deployment> {
        let mut spec = service.workload_spec.clone()?;
        let labels = Self::version_labels(service);

        spec.replicas = Some(config.default_replicas);
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };
        spec.strategy = Some(Self::rolling_update_strategy());

        let pod_meta = spec.template.metadata.get_or_insert_with(Default::default);
        pod_meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        if config.sidecar_injection {
            pod_meta
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SIDECAR_INJECT_ANNOTATION.to_string(), "true".to_string());
        }

        let mut metadata = k8s::kube_meta(Self::deployment_name(service), namespace);
        metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        Some(Deployment {
            metadata,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Fixed 25% surge / 25% unavailable rolling update
    fn rolling_update_strategy() -> DeploymentStrategy {
        DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::String("25%".to_string())),
                max_surge: Some(IntOrString::String("25%".to_string())),
            }),
        }
    }

    /// First declared port of a service; every route is derived from it
    pub fn primary_port(service: &topology::Service) -> Result<&ServicePort> {
        k8s::ports(&service.service_spec).first().ok_or_else(|| {
            Error::structural(
                "render cluster resources",
                format!("service '{}' declares no ports", service.service_id),
            )
        })
    }

    /// Primary port number as used by mesh routes
    pub fn primary_port_number(service: &topology::Service) -> Result<u16> {
        let port = Self::primary_port(service)?.port;
        u16::try_from(port).map_err(|_| {
            Error::structural(
                "render cluster resources",
                format!("service '{}' port {port} is out of range", service.service_id),
            )
        })
    }
}
