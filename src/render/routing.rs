//! VirtualService, DestinationRule and Gateway compilation
//!
//! HTTP services are routed per request on the `x-kardinal-destination`
//! header set by the tracing filters; every version gets its own subset.
//! TCP services cannot be pinned per request, so they get a single
//! port-matched route to the plain service host.

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::k8s::{ObjectMeta, LABEL_VERSION};
use crate::topology::{self, Ingress};
use crate::trace_routing::DESTINATION_HEADER;
use crate::Result;

use super::hosts::{host_for_flow, ingress_flow_hosts};
use super::istio::{
    ClientTlsSettings, Destination, DestinationRule, DestinationRuleSpec, Gateway, GatewayPort,
    GatewaySpec, HttpMatchRequest, HttpRoute, L4MatchAttributes, PortSelector, RouteDestination,
    Server, Subset, TcpRoute, TrafficPolicy, VirtualService, VirtualServiceSpec,
};
use super::workload::WorkloadCompiler;

/// Compiles routing resources for one namespace
pub struct RoutingCompiler<'a> {
    config: &'a EngineConfig,
    namespace: &'a str,
}

impl<'a> RoutingCompiler<'a> {
    /// Create a routing compiler
    pub fn new(config: &'a EngineConfig, namespace: &'a str) -> Self {
        Self { config, namespace }
    }

    /// HTTP VirtualService for all versions of a ServiceID.
    ///
    /// Each version is selected by an exact match on the destination header.
    /// When the service is an ingress target the service is bound to the
    /// ingress gateway and, if the ingress has a host, served on the flow
    /// hosts instead of the internal name. Requests carrying no known
    /// destination land on the base version when one exists.
    pub fn http_virtual_service(
        &self,
        versions: &[&topology::Service],
        ingress: Option<&Ingress>,
    ) -> Option<VirtualService> {
        let first = versions.first()?;
        let service_id = &first.service_id;
        let host = ingress.and_then(Ingress::host);

        let mut http: Vec<HttpRoute> = versions
            .iter()
            .map(|service| {
                let mut matches = vec![HttpMatchRequest::header_exact(
                    DESTINATION_HEADER,
                    format!("{service_id}-{}", service.version),
                )];
                if let Some(host) = host {
                    let flow_host = host_for_flow(host, &service.version, &self.config.base_version);
                    matches.push(HttpMatchRequest::header_exact(
                        DESTINATION_HEADER,
                        format!("{flow_host}-{}", service.version),
                    ));
                }
                HttpRoute {
                    match_: matches,
                    route: vec![subset_destination(service_id, &service.version)],
                }
            })
            .collect();

        if versions.iter().any(|s| s.version == self.config.base_version) {
            http.push(HttpRoute {
                match_: Vec::new(),
                route: vec![subset_destination(service_id, &self.config.base_version)],
            });
        }

        let hosts = match ingress {
            Some(ingress) if host.is_some() => ingress_flow_hosts(ingress, &self.config.base_version)
                .into_iter()
                .map(|(_, host)| host)
                .collect(),
            _ => vec![service_id.clone()],
        };
        let gateways = ingress
            .map(|i| vec![i.ingress_id.clone()])
            .unwrap_or_default();

        Some(VirtualService::new(
            ObjectMeta::new(service_id, self.namespace),
            VirtualServiceSpec {
                hosts,
                gateways,
                http,
                tcp: Vec::new(),
            },
        ))
    }

    /// DestinationRule with one subset per version.
    ///
    /// Mutual TLS is disabled toward non-base subsets, whose pods may come
    /// from plugin-produced workloads outside the mesh identity.
    pub fn destination_rule(&self, versions: &[&topology::Service]) -> Option<DestinationRule> {
        let service_id = &versions.first()?.service_id;
        let subsets = versions
            .iter()
            .map(|service| Subset {
                name: service.version.clone(),
                labels: BTreeMap::from([(LABEL_VERSION.to_string(), service.version.clone())]),
                traffic_policy: (service.version != self.config.base_version).then(|| {
                    TrafficPolicy {
                        tls: Some(ClientTlsSettings {
                            mode: "DISABLE".to_string(),
                        }),
                    }
                }),
            })
            .collect();

        Some(DestinationRule::new(
            ObjectMeta::new(service_id, self.namespace),
            DestinationRuleSpec {
                host: service_id.clone(),
                subsets,
            },
        ))
    }

    /// TCP VirtualService routing the first port to the plain service host
    pub fn tcp_virtual_service(&self, service: &topology::Service) -> Result<VirtualService> {
        let port = WorkloadCompiler::primary_port_number(service)?;
        Ok(VirtualService::new(
            ObjectMeta::new(&service.service_id, self.namespace),
            VirtualServiceSpec {
                hosts: vec![service.service_id.clone()],
                gateways: Vec::new(),
                http: Vec::new(),
                tcp: vec![TcpRoute {
                    match_: vec![L4MatchAttributes { port: Some(port) }],
                    route: vec![RouteDestination {
                        destination: Destination {
                            host: service.service_id.clone(),
                            subset: None,
                            port: Some(PortSelector { number: port }),
                        },
                        weight: Some(100),
                    }],
                }],
            },
        ))
    }

    /// Gateway for an ingress, listening on every active flow host.
    ///
    /// `None` when no flow is active on the ingress.
    pub fn gateway(&self, ingress: &Ingress) -> Option<Gateway> {
        if ingress.active_flow_ids.is_empty() {
            return None;
        }
        let mut hosts: Vec<String> = ingress_flow_hosts(ingress, &self.config.base_version)
            .into_iter()
            .map(|(_, host)| host)
            .collect();
        if hosts.is_empty() {
            hosts.push("*".to_string());
        }

        Some(Gateway::new(
            ObjectMeta::new(&ingress.ingress_id, self.namespace),
            GatewaySpec {
                selector: self.config.gateway.selector.clone(),
                servers: vec![Server {
                    port: GatewayPort {
                        number: self.config.gateway.port,
                        name: "http".to_string(),
                        protocol: "HTTP".to_string(),
                    },
                    hosts,
                }],
            },
        ))
    }
}

fn subset_destination(service_id: &str, version: &str) -> RouteDestination {
    RouteDestination {
        destination: Destination {
            host: service_id.to_string(),
            subset: Some(version.to_string()),
            port: None,
        },
        weight: Some(100),
    }
}
