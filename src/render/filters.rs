//! Lua EnvoyFilters implementing trace-based sticky routing
//!
//! Every HTTP service gets two sidecar filters:
//! - inbound: promotes a recognized tracing header to the canonical trace id
//!   header and rejects requests that carry none
//! - outbound: asks the trace router which version serves the next hop and
//!   writes the answer to the destination header
//!
//! The ingress gateway gets a single filter that assigns trace ids, registers
//! the routes of the flow a request entered through, and resolves its first
//! destination.

use std::collections::BTreeMap;

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::json;

use crate::config::EngineConfig;
use crate::k8s::{ObjectMeta, LABEL_APP};
use crate::trace_routing::{DESTINATION_HEADER, TRACE_HEADER_PRIORITIES, TRACE_ID_HEADER};
use crate::Result;

use super::istio::{
    EnvoyConfigObjectMatch, EnvoyConfigObjectPatch, EnvoyFilter, EnvoyFilterSpec, EnvoyPatch,
    FilterChainMatch, FilterMatch, ListenerMatch, WorkloadSelector,
};

/// Typed config URL of the Envoy Lua HTTP filter
pub const LUA_FILTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.lua.v3.Lua";

/// Network filter the Lua filters are inserted in front of
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";

const INBOUND_TEMPLATE: &str = "inbound-trace-check.lua";
const OUTBOUND_TEMPLATE: &str = "outbound-trace-router.lua";
const GATEWAY_TEMPLATE: &str = "gateway-tracing.lua";

/// Route the gateway registers for a flow entered through its host
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceRoute {
    /// External host of the flow
    pub flow_host: String,
    /// Service hostname the route applies to
    pub hostname: String,
    /// `{service}-{version}` destination
    pub destination: String,
}

/// Route from a flow host to its own destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostRoute {
    /// External host of the flow
    pub hostname: String,
    /// `{host}-{version}` destination
    pub destination: String,
}

/// Renders the Lua tracing filters
pub struct FilterRenderer<'a> {
    env: Environment<'static>,
    config: &'a EngineConfig,
}

impl<'a> FilterRenderer<'a> {
    /// Create a renderer with the bundled Lua templates loaded
    pub fn new(config: &'a EngineConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.add_template(
            INBOUND_TEMPLATE,
            include_str!("../../templates/inbound-trace-check.lua"),
        )?;
        env.add_template(
            OUTBOUND_TEMPLATE,
            include_str!("../../templates/outbound-trace-router.lua"),
        )?;
        env.add_template(
            GATEWAY_TEMPLATE,
            include_str!("../../templates/gateway-tracing.lua"),
        )?;
        Ok(Self { env, config })
    }

    /// Inbound trace id check script
    pub fn inbound_script(&self) -> Result<String> {
        let script = self.env.get_template(INBOUND_TEMPLATE)?.render(context! {
            trace_header => TRACE_ID_HEADER,
            trace_header_priorities => TRACE_HEADER_PRIORITIES,
        })?;
        Ok(script)
    }

    /// Outbound trace router script
    pub fn outbound_script(&self) -> Result<String> {
        let router = &self.config.trace_router;
        let script = self.env.get_template(OUTBOUND_TEMPLATE)?.render(context! {
            trace_header => TRACE_ID_HEADER,
            destination_header => DESTINATION_HEADER,
            router_cluster => router.cluster(),
            router_host => router.host,
            timeout_ms => router.timeout_ms,
            fallback_version => self.config.base_version,
        })?;
        Ok(script)
    }

    /// Gateway tracing script
    pub fn gateway_script(
        &self,
        service_routes: &[ServiceRoute],
        host_routes: &[HostRoute],
    ) -> Result<String> {
        let router = &self.config.trace_router;
        let script = self.env.get_template(GATEWAY_TEMPLATE)?.render(context! {
            trace_header => TRACE_ID_HEADER,
            trace_header_priorities => TRACE_HEADER_PRIORITIES,
            destination_header => DESTINATION_HEADER,
            router_cluster => router.cluster(),
            router_host => router.host,
            timeout_ms => router.timeout_ms,
            fallback_version => self.config.base_version,
            service_routes => service_routes,
            host_routes => host_routes,
        })?;
        Ok(script)
    }

    /// Inbound filter for a service's sidecars
    pub fn inbound_filter(&self, service_id: &str, namespace: &str) -> Result<EnvoyFilter> {
        Ok(sidecar_filter(
            format!("{service_id}-inbound-trace-id-check"),
            service_id,
            namespace,
            "SIDECAR_INBOUND",
            self.inbound_script()?,
        ))
    }

    /// Outbound filter for a service's sidecars
    pub fn outbound_filter(&self, service_id: &str, namespace: &str) -> Result<EnvoyFilter> {
        Ok(sidecar_filter(
            format!("{service_id}-outbound-trace-router"),
            service_id,
            namespace,
            "SIDECAR_OUTBOUND",
            self.outbound_script()?,
        ))
    }

    /// Filter on the ingress gateway workload
    pub fn gateway_filter(
        &self,
        service_routes: &[ServiceRoute],
        host_routes: &[HostRoute],
    ) -> Result<EnvoyFilter> {
        let gateway = &self.config.gateway;
        Ok(EnvoyFilter::new(
            ObjectMeta::new(&gateway.filter_name, &gateway.namespace),
            EnvoyFilterSpec {
                workload_selector: Some(WorkloadSelector {
                    labels: gateway.selector.clone(),
                }),
                config_patches: vec![lua_patch(
                    "GATEWAY",
                    self.gateway_script(service_routes, host_routes)?,
                )],
            },
        ))
    }
}

fn sidecar_filter(
    name: String,
    service_id: &str,
    namespace: &str,
    context: &str,
    script: String,
) -> EnvoyFilter {
    EnvoyFilter::new(
        ObjectMeta::new(name, namespace),
        EnvoyFilterSpec {
            workload_selector: Some(WorkloadSelector {
                labels: BTreeMap::from([(LABEL_APP.to_string(), service_id.to_string())]),
            }),
            config_patches: vec![lua_patch(context, script)],
        },
    )
}

fn lua_patch(context: &str, script: String) -> EnvoyConfigObjectPatch {
    EnvoyConfigObjectPatch {
        apply_to: "HTTP_FILTER".to_string(),
        match_: EnvoyConfigObjectMatch {
            context: context.to_string(),
            listener: Some(ListenerMatch {
                filter_chain: FilterChainMatch {
                    filter: FilterMatch {
                        name: HTTP_CONNECTION_MANAGER.to_string(),
                    },
                },
            }),
        },
        patch: EnvoyPatch {
            operation: "INSERT_BEFORE".to_string(),
            value: json!({
                "name": "envoy.lua",
                "typed_config": {
                    "@type": LUA_FILTER_TYPE,
                    "inlineCode": script,
                }
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline_code(filter: &EnvoyFilter) -> &str {
        filter.spec.config_patches[0].patch.value["typed_config"]["inlineCode"]
            .as_str()
            .unwrap()
    }

    #[test]
    fn inbound_script_checks_every_priority_header() {
        let config = EngineConfig::default();
        let script = FilterRenderer::new(&config).unwrap().inbound_script().unwrap();

        for header in TRACE_HEADER_PRIORITIES {
            assert!(script.contains(&format!("\"{header}\"")), "missing {header}");
        }
        assert!(script.contains("headers:get(\"x-kardinal-trace-id\")"));
        assert!(script.contains("\"400\""));
    }

    #[test]
    fn outbound_script_falls_back_to_base_version() {
        let config = EngineConfig::default();
        let script = FilterRenderer::new(&config)
            .unwrap()
            .outbound_script()
            .unwrap();

        assert!(script.contains("hostname .. \"-prod\""));
        assert!(script.contains("\"outbound|8080||trace-router.default.svc.cluster.local\""));
        assert!(script.contains("headers:add(\"x-kardinal-destination\", destination)"));
        assert!(script.contains("5000"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn sidecar_filters_select_service_pods() {
        let config = EngineConfig::default();
        let renderer = FilterRenderer::new(&config).unwrap();

        let inbound = renderer.inbound_filter("cartservice", "boutique").unwrap();
        assert_eq!(inbound.metadata.name, "cartservice-inbound-trace-id-check");
        assert_eq!(inbound.metadata.namespace, "boutique");
        assert_eq!(
            inbound.spec.workload_selector.as_ref().unwrap().labels[LABEL_APP],
            "cartservice"
        );
        let patch = &inbound.spec.config_patches[0];
        assert_eq!(patch.apply_to, "HTTP_FILTER");
        assert_eq!(patch.match_.context, "SIDECAR_INBOUND");
        assert_eq!(patch.patch.operation, "INSERT_BEFORE");
        assert_eq!(
            patch.patch.value["typed_config"]["@type"],
            serde_json::Value::from(LUA_FILTER_TYPE)
        );

        let outbound = renderer.outbound_filter("cartservice", "boutique").unwrap();
        assert_eq!(outbound.metadata.name, "cartservice-outbound-trace-router");
        assert_eq!(outbound.spec.config_patches[0].match_.context, "SIDECAR_OUTBOUND");
        assert!(inline_code(&outbound).contains("determine_destination"));
    }

    #[test]
    fn gateway_filter_registers_flow_routes() {
        let config = EngineConfig::default();
        let renderer = FilterRenderer::new(&config).unwrap();
        let filter = renderer
            .gateway_filter(
                &[ServiceRoute {
                    flow_host: "dev-1.example.com".to_string(),
                    hostname: "cartservice".to_string(),
                    destination: "cartservice-dev-1".to_string(),
                }],
                &[HostRoute {
                    hostname: "dev-1.example.com".to_string(),
                    destination: "dev-1.example.com-dev-1".to_string(),
                }],
            )
            .unwrap();

        assert_eq!(filter.metadata.name, "kardinal-gateway-tracing");
        assert_eq!(filter.metadata.namespace, "istio-system");
        assert_eq!(filter.spec.config_patches[0].match_.context, "GATEWAY");
        assert_eq!(
            filter.spec.workload_selector.as_ref().unwrap().labels["istio"],
            "ingressgateway"
        );

        let script = inline_code(&filter);
        assert!(script.contains("if hostname == \"dev-1.example.com\" then"));
        assert!(script.contains(
            "set_route(request_handle, trace_id, \"cartservice\", \"cartservice-dev-1\")"
        ));
        assert!(script.contains(
            "set_route(request_handle, trace_id, \"dev-1.example.com\", \"dev-1.example.com-dev-1\")"
        ));
    }

    #[test]
    fn gateway_script_without_routes_still_assigns_trace_ids() {
        let config = EngineConfig::default();
        let script = FilterRenderer::new(&config)
            .unwrap()
            .gateway_script(&[], &[])
            .unwrap();
        assert!(script.contains("/generate-trace-id"));
        assert!(!script.contains("set_route(request_handle, trace_id, \""));
    }
}
