//! Mesh renderer
//!
//! Deterministic mapping from a resolved topology to the resources that make
//! it servable:
//!
//! | Per                    | Resources                                         |
//! |------------------------|---------------------------------------------------|
//! | ServiceID              | Service, VirtualService, DestinationRule (HTTP)   |
//! | (ServiceID, Version)   | Deployment                                        |
//! | HTTP ServiceID         | inbound + outbound tracing EnvoyFilters           |
//! | active Ingress         | Gateway                                           |
//! | topology with gateways | one gateway tracing EnvoyFilter                   |
//!
//! External services are not rendered; they live outside the cluster.

mod filters;
mod hosts;
pub mod istio;
mod routing;
mod workload;

pub use filters::{FilterRenderer, HostRoute, ServiceRoute, HTTP_CONNECTION_MANAGER, LUA_FILTER_TYPE};
pub use hosts::{flow_host, host_for_flow, ingress_flow_hosts};
pub use routing::RoutingCompiler;
pub use workload::{WorkloadCompiler, SIDECAR_INJECT_ANNOTATION};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::k8s::{Deployment, Service};
use crate::topology::{self, ClusterTopology};
use crate::Result;

use istio::{DestinationRule, EnvoyFilter, Gateway, VirtualService};

/// Rendered resources of one topology
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterResources {
    /// One per ServiceID
    pub services: Vec<Service>,
    /// One per (ServiceID, Version)
    pub deployments: Vec<Deployment>,
    /// One per ServiceID
    pub virtual_services: Vec<VirtualService>,
    /// One per HTTP ServiceID
    pub destination_rules: Vec<DestinationRule>,
    /// One per ingress with active flows
    pub gateways: Vec<Gateway>,
    /// Tracing filters
    pub envoy_filters: Vec<EnvoyFilter>,
}

impl ClusterResources {
    /// Total number of resources
    pub fn len(&self) -> usize {
        self.services.len()
            + self.deployments.len()
            + self.virtual_services.len()
            + self.destination_rules.len()
            + self.gateways.len()
            + self.envoy_filters.len()
    }

    /// Whether nothing was rendered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Renders topologies with a fixed configuration
pub struct MeshRenderer {
    config: EngineConfig,
}

impl MeshRenderer {
    /// Create a renderer
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Renderer configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Render every resource needed to serve `topology` in `namespace`.
    ///
    /// A non-external service without ports is a structural error: its first
    /// port drives route generation.
    pub fn render(&self, topology: &ClusterTopology, namespace: &str) -> Result<ClusterResources> {
        let routing = RoutingCompiler::new(&self.config, namespace);
        let filters = FilterRenderer::new(&self.config)?;
        let mut resources = ClusterResources::default();

        for versions in group_by_service_id(topology) {
            let Some(first) = versions.first() else {
                continue;
            };
            if first.is_external {
                debug!(service = %first.service_id, "skipping external service");
                continue;
            }
            WorkloadCompiler::primary_port_number(first)?;

            resources
                .services
                .push(WorkloadCompiler::compile_service(first, namespace));
            resources.deployments.extend(
                versions
                    .iter()
                    .filter_map(|s| WorkloadCompiler::compile_deployment(s, namespace, &self.config)),
            );

            if first.is_http() {
                let ingress = topology.ingress_for_service(&first.service_id);
                resources
                    .virtual_services
                    .extend(routing.http_virtual_service(&versions, ingress));
                resources
                    .destination_rules
                    .extend(routing.destination_rule(&versions));
                resources
                    .envoy_filters
                    .push(filters.inbound_filter(&first.service_id, namespace)?);
                resources
                    .envoy_filters
                    .push(filters.outbound_filter(&first.service_id, namespace)?);
            } else {
                resources
                    .virtual_services
                    .push(routing.tcp_virtual_service(first)?);
            }
        }

        resources
            .gateways
            .extend(topology.ingresses.iter().filter_map(|i| routing.gateway(i)));

        if !resources.gateways.is_empty() {
            let (service_routes, host_routes) = self.gateway_routes(topology);
            resources
                .envoy_filters
                .push(filters.gateway_filter(&service_routes, &host_routes)?);
        }

        info!(
            flow_id = %topology.flow_id,
            namespace,
            services = resources.services.len(),
            deployments = resources.deployments.len(),
            virtual_services = resources.virtual_services.len(),
            gateways = resources.gateways.len(),
            envoy_filters = resources.envoy_filters.len(),
            "rendered cluster resources"
        );
        Ok(resources)
    }

    /// Routes the gateway registers with the trace router.
    ///
    /// For each non-base flow reachable through a hosted ingress, every
    /// service forked into that flow is pinned to it, as is the flow host
    /// itself. The base flow needs no routes; it is the fallback.
    fn gateway_routes(&self, topology: &ClusterTopology) -> (Vec<ServiceRoute>, Vec<HostRoute>) {
        let mut service_routes = Vec::new();
        let mut host_routes = Vec::new();

        for ingress in &topology.ingresses {
            for (flow_id, flow_host) in ingress_flow_hosts(ingress, &self.config.base_version) {
                if flow_id == self.config.base_version {
                    continue;
                }
                for service in topology
                    .services
                    .iter()
                    .filter(|s| s.version == flow_id && !s.is_external)
                {
                    service_routes.push(ServiceRoute {
                        flow_host: flow_host.clone(),
                        hostname: service.service_id.clone(),
                        destination: format!("{}-{flow_id}", service.service_id),
                    });
                }
                host_routes.push(HostRoute {
                    destination: format!("{flow_host}-{flow_id}"),
                    hostname: flow_host,
                });
            }
        }
        (service_routes, host_routes)
    }
}

/// Render with the default configuration
pub fn render_cluster_resources(
    topology: &ClusterTopology,
    namespace: &str,
) -> Result<ClusterResources> {
    MeshRenderer::new(EngineConfig::default()).render(topology, namespace)
}

/// Services grouped by ServiceID, groups and versions in declaration order
fn group_by_service_id(topology: &ClusterTopology) -> Vec<Vec<&topology::Service>> {
    topology
        .service_ids()
        .into_iter()
        .map(|id| {
            topology
                .services
                .iter()
                .filter(|s| s.service_id == id)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{create_dev_flow, merge_cluster_topologies};
    use crate::k8s;
    use crate::plugin::PluginRunner;
    use crate::topology::fixtures::{boutique, external_service, http_service, tcp_service};
    use crate::topology::FlowPatch;
    use crate::Error;

    fn render(topology: &ClusterTopology) -> ClusterResources {
        render_cluster_resources(topology, "boutique").unwrap()
    }

    fn names<T>(items: &[T], name: impl Fn(&T) -> &str) -> Vec<&str> {
        items.iter().map(name).collect()
    }

    fn merged_with_cart_flow() -> ClusterTopology {
        let base = boutique();
        let runner = PluginRunner::passthrough();
        let flow = create_dev_flow(
            &runner,
            &base,
            &base,
            &FlowPatch::single("dev-1", "cartservice", "cartservice:dev"),
        )
        .unwrap();
        merge_cluster_topologies(&base, &[flow])
    }

    #[test]
    fn http_service_gets_virtual_service_and_destination_rule() {
        let mut topology = ClusterTopology::default();
        topology.services.push(http_service("cartservice", "prod"));

        let resources = render(&topology);
        assert_eq!(resources.virtual_services.len(), 1);
        assert_eq!(resources.virtual_services[0].spec.http.len(), 2);
        assert!(resources.virtual_services[0].spec.tcp.is_empty());
        assert_eq!(resources.destination_rules.len(), 1);
        assert_eq!(resources.destination_rules[0].spec.subsets.len(), 1);
    }

    #[test]
    fn tcp_service_gets_tcp_route_and_no_destination_rule() {
        let mut topology = ClusterTopology::default();
        topology.services.push(tcp_service("redis-cart", "prod", true));

        let resources = render(&topology);
        assert_eq!(resources.virtual_services.len(), 1);
        assert!(resources.virtual_services[0].spec.http.is_empty());
        assert_eq!(resources.virtual_services[0].spec.tcp.len(), 1);
        assert!(resources.destination_rules.is_empty());
        assert!(resources.envoy_filters.is_empty());
    }

    #[test]
    fn base_topology_renders_one_of_each_per_service() {
        let resources = render(&boutique());

        assert_eq!(resources.services.len(), 7);
        assert_eq!(resources.deployments.len(), 7);
        assert_eq!(resources.virtual_services.len(), 7);
        // redis-cart is TCP
        assert_eq!(resources.destination_rules.len(), 6);
        assert_eq!(resources.gateways.len(), 1);
        // two sidecar filters per HTTP service plus the gateway filter
        assert_eq!(resources.envoy_filters.len(), 13);
        assert_eq!(resources.len(), 41);
    }

    #[test]
    fn merged_flow_adds_versions_not_services() {
        let resources = render(&merged_with_cart_flow());

        assert_eq!(resources.services.len(), 7);
        let deployments = names(&resources.deployments, |d| k8s::name_of(&d.metadata));
        assert!(deployments.contains(&"cartservice-dev-1"));
        assert!(deployments.contains(&"redis-cart-dev-1"));
        assert!(deployments.contains(&"cartservice-prod"));
        assert!(!deployments.contains(&"frontend-dev-1"));
        assert_eq!(deployments.len(), 9);

        let cart_rule = resources
            .destination_rules
            .iter()
            .find(|r| r.metadata.name == "cartservice")
            .unwrap();
        assert_eq!(
            names(&cart_rule.spec.subsets, |s| s.name.as_str()),
            vec!["prod", "dev-1"]
        );

        let dev_image = resources
            .deployments
            .iter()
            .find(|d| k8s::name_of(&d.metadata) == "cartservice-dev-1")
            .and_then(|d| d.spec.as_ref())
            .and_then(k8s::primary_image);
        assert_eq!(dev_image, Some("cartservice:dev"));
    }

    #[test]
    fn gateway_serves_every_flow_host() {
        let resources = render(&merged_with_cart_flow());

        assert_eq!(
            resources.gateways[0].spec.servers[0].hosts,
            vec!["web.example.com", "dev-1.example.com"]
        );
        let frontend = resources
            .virtual_services
            .iter()
            .find(|v| v.metadata.name == "frontend")
            .unwrap();
        assert_eq!(frontend.spec.gateways, vec!["frontend-ingress"]);
        assert_eq!(
            frontend.spec.hosts,
            vec!["web.example.com", "dev-1.example.com"]
        );
    }

    #[test]
    fn gateway_filter_pins_forked_services_to_flow() {
        let renderer = MeshRenderer::new(EngineConfig::default());
        let (service_routes, host_routes) = renderer.gateway_routes(&merged_with_cart_flow());

        assert!(service_routes.iter().all(|r| r.flow_host == "dev-1.example.com"));
        assert!(service_routes
            .iter()
            .any(|r| r.hostname == "cartservice" && r.destination == "cartservice-dev-1"));
        assert!(!service_routes.iter().any(|r| r.destination.ends_with("-prod")));
        assert_eq!(
            host_routes,
            vec![HostRoute {
                hostname: "dev-1.example.com".to_string(),
                destination: "dev-1.example.com-dev-1".to_string(),
            }]
        );
    }

    #[test]
    fn external_services_are_not_rendered() {
        let mut topology = ClusterTopology::default();
        topology.services.push(external_service("stripe", "prod"));

        assert!(render(&topology).is_empty());
    }

    #[test]
    fn service_without_ports_is_structural() {
        let mut service = http_service("frontend", "prod");
        service.service_spec.ports = None;
        let topology = ClusterTopology {
            services: vec![service],
            ..Default::default()
        };

        let err = render_cluster_resources(&topology, "ns").unwrap_err();
        assert!(matches!(err, Error::Structural { .. }));
        assert!(err.to_string().contains("frontend"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let topology = merged_with_cart_flow();
        assert_eq!(render(&topology), render(&topology));
    }
}
