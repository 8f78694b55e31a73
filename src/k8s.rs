//! Kubernetes types
//!
//! Core objects read from manifests and rendered back (Service, Deployment,
//! Ingress) are the upstream `k8s-openapi` types, so every field a manifest
//! declares (health checks, resources, volumes, `valueFrom` env, named
//! target ports) survives parsing and rendering. Helpers below give the engine the narrow
//! views it needs over those option-heavy shapes.
//!
//! Istio resources have no upstream schema crate; they are hand-rolled in
//! [`crate::render::istio`] over the lighter [`ObjectMeta`] defined here and
//! implement [`HasApiResource`] for consistent API version handling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
pub use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
pub use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta as KubeObjectMeta,
};
pub use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Label carrying the logical service name
pub const LABEL_APP: &str = "app";
/// Label carrying the version (prod or flow id) of a workload
pub const LABEL_VERSION: &str = "version";
/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Managed-by value stamped on every rendered resource
pub const LABEL_MANAGED_BY_DEVFLOW: &str = "devflow";

/// Resource types with a fixed API version and kind
pub trait HasApiResource {
    /// API version (e.g. "networking.istio.io/v1beta1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g. "VirtualService")
    const KIND: &'static str;
}

/// Implement `default_api_version()` and `default_kind()` serde defaults for
/// a type implementing [`HasApiResource`].
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as $crate::k8s::HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as $crate::k8s::HasApiResource>::KIND.to_string()
            }
        }
    };
}

pub(crate) use impl_api_defaults;

// =============================================================================
// ObjectMeta
// =============================================================================

/// Metadata of rendered mesh resources.
///
/// Always carries a name and namespace, unlike the upstream
/// [`KubeObjectMeta`] used by core objects.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label set
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_DEVFLOW.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Core object helpers
// =============================================================================

/// Metadata for a rendered core object, with the managed-by label set
pub fn kube_meta(name: impl Into<String>, namespace: impl Into<String>) -> KubeObjectMeta {
    KubeObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        labels: Some(BTreeMap::from([(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_DEVFLOW.to_string(),
        )])),
        ..Default::default()
    }
}

/// Name of a core object, empty when unset
pub fn name_of(meta: &KubeObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

/// Look up an annotation value
pub fn annotation<'a>(meta: &'a KubeObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Look up a label value
pub fn label<'a>(meta: &'a KubeObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}

/// Create a named TCP service port with the given application protocol
pub fn service_port(name: impl Into<String>, port: i32, app_protocol: Option<&str>) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        protocol: Some("TCP".to_string()),
        app_protocol: app_protocol.map(str::to_string),
        ..Default::default()
    }
}

/// Declared ports of a service spec
pub fn ports(spec: &ServiceSpec) -> &[ServicePort] {
    spec.ports.as_deref().unwrap_or_default()
}

/// First container of the pod template, the one patches apply to
pub fn primary_container_mut(spec: &mut DeploymentSpec) -> Option<&mut Container> {
    spec.template.spec.as_mut()?.containers.first_mut()
}

/// Image of the first container
pub fn primary_image(spec: &DeploymentSpec) -> Option<&str> {
    spec.template.spec.as_ref()?.containers.first()?.image.as_deref()
}

/// Create an env var with a literal value
pub fn env_literal(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Set an env var to a literal, replacing an existing entry with the same name.
///
/// A replaced entry loses any `valueFrom` source.
pub fn upsert_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(env_literal(name, value)),
    }
}

/// Backend service names referenced by an ingress rule's paths
pub fn backend_services(rule: &IngressRule) -> impl Iterator<Item = &str> {
    rule.http
        .iter()
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .map(|service| service.name.as_str())
}

/// Host-based rules of an ingress
pub fn ingress_rules(ingress: &Ingress) -> &[IngressRule] {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_meta_new_sets_managed_by() {
        let meta = ObjectMeta::new("frontend", "prod");
        assert_eq!(meta.namespace, "prod");
        assert_eq!(
            meta.labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(LABEL_MANAGED_BY_DEVFLOW)
        );
        assert!(meta.annotations.is_empty());
    }

    #[test]
    fn kube_meta_sets_managed_by() {
        let meta = kube_meta("cart-prod", "default");
        assert_eq!(name_of(&meta), "cart-prod");
        assert_eq!(meta.namespace.as_deref(), Some("default"));
        assert_eq!(label(&meta, LABEL_MANAGED_BY), Some(LABEL_MANAGED_BY_DEVFLOW));
    }

    #[test]
    fn service_manifest_keeps_named_target_port() {
        let yaml = r#"
apiVersion: v1
kind: Service
metadata:
  name: cartservice
  annotations:
    kardinal.dev.service/dependencies: "redis-cart:tcp-redis"
spec:
  selector:
    app: cartservice
  ports:
    - name: grpc
      port: 7070
      targetPort: grpc
"#;
        let svc: Service = serde_yaml::from_str(yaml).unwrap();
        let port = &ports(svc.spec.as_ref().unwrap())[0];
        assert_eq!(port.target_port, Some(IntOrString::String("grpc".to_string())));
        assert_eq!(port.app_protocol, None);
        assert_eq!(
            annotation(&svc.metadata, "kardinal.dev.service/dependencies"),
            Some("redis-cart:tcp-redis")
        );
    }

    #[test]
    fn deployment_serializes_camel_case() {
        let spec = DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                    max_surge: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            ..Default::default()
        };
        let deployment = Deployment {
            metadata: kube_meta("cart-prod", "default"),
            spec: Some(spec),
            ..Default::default()
        };
        let json = serde_json::to_value(&deployment).unwrap();
        assert_eq!(json["apiVersion"], "apps/v1");
        assert_eq!(json["kind"], "Deployment");
        assert_eq!(json["spec"]["strategy"]["type"], "RollingUpdate");
        assert_eq!(json["spec"]["strategy"]["rollingUpdate"]["maxSurge"], "25%");
    }

    #[test]
    fn upsert_env_replaces_and_appends() {
        let mut container = Container {
            name: "app".to_string(),
            image: Some("app:1".to_string()),
            env: Some(vec![env_literal("MODE", "prod")]),
            ..Default::default()
        };
        upsert_env(&mut container, "MODE", "dev");
        upsert_env(&mut container, "DEBUG", "1");
        assert_eq!(
            container.env,
            Some(vec![env_literal("MODE", "dev"), env_literal("DEBUG", "1")])
        );
    }

    #[test]
    fn upsert_env_on_container_without_env() {
        let mut container = Container {
            name: "app".to_string(),
            ..Default::default()
        };
        upsert_env(&mut container, "MODE", "dev");
        assert_eq!(container.env, Some(vec![env_literal("MODE", "dev")]));
    }

    #[test]
    fn ingress_rule_lists_backends() {
        let yaml = r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: frontend-ingress
spec:
  rules:
    - host: web.example.com
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: frontend
                port:
                  number: 80
"#;
        let ingress: Ingress = serde_yaml::from_str(yaml).unwrap();
        let rule = &ingress_rules(&ingress)[0];
        assert_eq!(backend_services(rule).collect::<Vec<_>>(), vec!["frontend"]);
        assert_eq!(rule.http.as_ref().unwrap().paths[0].path_type, "Prefix");
    }
}
