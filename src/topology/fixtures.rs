//! Test fixtures: a trimmed online-boutique topology
//!
//! ```text
//! frontend ──▶ checkoutservice ──▶ paymentservice (stateful)
//!     │              ├──────────▶ shippingservice (stateful)
//!     │              ├──────────▶ cartservice ──▶ redis-cart (stateful, tcp)
//!     │              └──────────▶ productcatalogservice
//!     ├──▶ cartservice
//!     └──▶ productcatalogservice
//! ```

use std::collections::BTreeMap;

use crate::k8s::{
    service_port, Container, DeploymentSpec, HTTPIngressPath, HTTPIngressRuleValue,
    IngressBackend, IngressRule, IngressServiceBackend, PodSpec, PodTemplateSpec,
    ServiceBackendPort, ServicePort, ServiceSpec,
};

use super::{ClusterTopology, Ingress, Service, ServiceDependency, ServiceRef};

pub(crate) fn workload(id: &str) -> DeploymentSpec {
    DeploymentSpec {
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: id.to_string(),
                    image: Some(format!("{id}:latest")),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service(id: &str, version: &str, port: ServicePort, stateful: bool) -> Service {
    Service {
        service_id: id.to_string(),
        version: version.to_string(),
        service_spec: ServiceSpec {
            selector: Some(BTreeMap::from([("app".to_string(), id.to_string())])),
            ports: Some(vec![port]),
            ..Default::default()
        },
        workload_spec: Some(workload(id)),
        is_external: false,
        is_stateful: stateful,
        stateful_plugins: Vec::new(),
    }
}

pub(crate) fn http_service(id: &str, version: &str) -> Service {
    service(id, version, service_port("http", 80, Some("HTTP")), false)
}

pub(crate) fn stateful_http_service(id: &str, version: &str) -> Service {
    service(id, version, service_port("http", 80, Some("HTTP")), true)
}

pub(crate) fn tcp_service(id: &str, version: &str, stateful: bool) -> Service {
    service(id, version, service_port("tcp-redis", 6379, None), stateful)
}

pub(crate) fn external_service(id: &str, version: &str) -> Service {
    Service {
        service_id: id.to_string(),
        version: version.to_string(),
        service_spec: ServiceSpec {
            ports: Some(vec![service_port("https", 443, None)]),
            ..Default::default()
        },
        workload_spec: None,
        is_external: true,
        is_stateful: false,
        stateful_plugins: Vec::new(),
    }
}

pub(crate) fn dep(from: &str, to: &str, port: Option<ServicePort>) -> ServiceDependency {
    ServiceDependency {
        service: ServiceRef::new(from, "prod"),
        depends_on: ServiceRef::new(to, "prod"),
        dependency_port: port,
    }
}

pub(crate) fn ingress(id: &str, host: Option<&str>, target: &str, flows: &[&str]) -> Ingress {
    Ingress {
        ingress_id: id.to_string(),
        active_flow_ids: flows.iter().map(|f| f.to_string()).collect(),
        rules: vec![IngressRule {
            host: host.map(str::to_string),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: target.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(80),
                                name: None,
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }],
        ingress_class_name: Some("istio".to_string()),
    }
}

pub(crate) fn boutique() -> ClusterTopology {
    let http = || Some(service_port("http", 80, Some("HTTP")));
    let redis = Some(service_port("tcp-redis", 6379, None));

    ClusterTopology {
        flow_id: "prod".to_string(),
        namespace: "boutique".to_string(),
        services: vec![
            http_service("frontend", "prod"),
            http_service("checkoutservice", "prod"),
            stateful_http_service("paymentservice", "prod"),
            stateful_http_service("shippingservice", "prod"),
            http_service("cartservice", "prod"),
            tcp_service("redis-cart", "prod", true),
            http_service("productcatalogservice", "prod"),
        ],
        service_dependencies: vec![
            dep("frontend", "checkoutservice", http()),
            dep("frontend", "cartservice", http()),
            dep("frontend", "productcatalogservice", http()),
            dep("checkoutservice", "paymentservice", http()),
            dep("checkoutservice", "shippingservice", http()),
            dep("checkoutservice", "cartservice", http()),
            dep("checkoutservice", "productcatalogservice", http()),
            dep("cartservice", "redis-cart", redis),
        ],
        ingresses: vec![ingress(
            "frontend-ingress",
            Some("web.example.com"),
            "frontend",
            &["prod"],
        )],
    }
}
