//! Per-tenant flow state
//!
//! Each tenant owns a base topology and the flows created on top of it. The
//! registry hands out one lock per tenant, so requests for different tenants
//! never contend and a tenant's state is only ever changed under its lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::flow::{create_dev_flow, delete_dev_flow, merge_cluster_topologies};
use crate::plugin::{PluginExecutor, PluginRunner};
use crate::render::{ClusterResources, MeshRenderer};
use crate::topology::{ClusterTopology, FlowPatch};
use crate::view::{cluster_topology_view, TopologyView};
use crate::{Error, Result};

/// A flow created for a tenant
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveFlow {
    /// Patch the flow was created from
    pub patch: FlowPatch,
    /// Flow topology
    pub topology: ClusterTopology,
}

/// One tenant's base topology and active flows
pub struct TenantContext {
    tenant_id: String,
    base: ClusterTopology,
    flows: Vec<ActiveFlow>,
    runner: PluginRunner,
    renderer: MeshRenderer,
}

impl TenantContext {
    /// Create a tenant with no active flows
    pub fn new(
        tenant_id: impl Into<String>,
        base: ClusterTopology,
        runner: PluginRunner,
        config: EngineConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            base,
            flows: Vec::new(),
            runner,
            renderer: MeshRenderer::new(config),
        }
    }

    /// Tenant id
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Base topology
    pub fn base(&self) -> &ClusterTopology {
        &self.base
    }

    /// Active flows in creation order
    pub fn flows(&self) -> &[ActiveFlow] {
        &self.flows
    }

    /// Ids of the active flows
    pub fn flow_ids(&self) -> Vec<&str> {
        self.flows.iter().map(|f| f.patch.flow_id.as_str()).collect()
    }

    /// Topology of an active flow
    pub fn flow(&self, flow_id: &str) -> Option<&ClusterTopology> {
        self.flows
            .iter()
            .find(|f| f.patch.flow_id == flow_id)
            .map(|f| &f.topology)
    }

    /// Plugin runner holding this tenant's hook state
    pub fn runner(&self) -> &PluginRunner {
        &self.runner
    }

    /// Base merged with every active flow
    pub fn serving_topology(&self) -> ClusterTopology {
        let flows: Vec<ClusterTopology> = self.flows.iter().map(|f| f.topology.clone()).collect();
        merge_cluster_topologies(&self.base, &flows)
    }

    /// Create a flow, replacing any active flow with the same id.
    ///
    /// Dependencies are resolved against the serving topology without the
    /// flow being replaced. A replacement is first checked against a
    /// passthrough runner, so an unknown service or malformed patch fails
    /// before the active flow is touched. The old flow is then torn down; if
    /// that fails it stays active. If a plugin hook of the new flow fails, the
    /// old flow is recreated from its patch before the error is returned.
    pub fn create_flow(&mut self, patch: FlowPatch) -> Result<&ClusterTopology> {
        let base_version = &self.renderer.config().base_version;
        if patch.flow_id == *base_version {
            return Err(Error::structural(
                "create flow",
                format!("flow id '{}' is reserved for the base topology", patch.flow_id),
            ));
        }

        let Some(idx) = self.position(&patch.flow_id) else {
            let reference = self.serving_topology();
            let topology = create_dev_flow(&self.runner, &self.base, &reference, &patch)?;
            return Ok(self.activate(ActiveFlow { patch, topology }));
        };

        info!(tenant = %self.tenant_id, flow_id = %patch.flow_id, "replacing existing flow");
        let previous = self.flows.remove(idx);
        let reference = self.serving_topology();

        let dry_run = PluginRunner::passthrough();
        if let Err(e) = create_dev_flow(&dry_run, &self.base, &reference, &patch) {
            self.flows.insert(idx, previous);
            return Err(e);
        }
        if let Err(e) = delete_dev_flow(&self.runner, &previous.topology, &patch.flow_id) {
            warn!(tenant = %self.tenant_id, flow_id = %patch.flow_id, error = %e, "teardown of replaced flow failed");
            self.flows.insert(idx, previous);
            return Err(e);
        }

        match create_dev_flow(&self.runner, &self.base, &reference, &patch) {
            Ok(topology) => Ok(self.activate(ActiveFlow { patch, topology })),
            Err(e) => {
                warn!(tenant = %self.tenant_id, flow_id = %patch.flow_id, error = %e, "replacement failed, restoring previous flow");
                match create_dev_flow(&self.runner, &self.base, &reference, &previous.patch) {
                    Ok(topology) => self.flows.insert(
                        idx,
                        ActiveFlow {
                            patch: previous.patch,
                            topology,
                        },
                    ),
                    Err(restore) => {
                        warn!(tenant = %self.tenant_id, flow_id = %patch.flow_id, error = %restore, "previous flow could not be restored")
                    }
                }
                Err(e)
            }
        }
    }

    /// Tear down and forget a flow. Unknown ids are NotFound.
    ///
    /// If teardown fails the flow stays active so it can be retried.
    pub fn delete_flow(&mut self, flow_id: &str) -> Result<()> {
        let idx = self
            .position(flow_id)
            .ok_or_else(|| Error::not_found("flow", flow_id, "delete flow"))?;

        if let Err(e) = delete_dev_flow(&self.runner, &self.flows[idx].topology, flow_id) {
            warn!(tenant = %self.tenant_id, flow_id = %flow_id, error = %e, "flow teardown failed");
            return Err(e);
        }
        self.flows.remove(idx);
        info!(tenant = %self.tenant_id, flow_id = %flow_id, "flow deleted");
        Ok(())
    }

    /// Render the serving topology
    pub fn render(&self) -> Result<ClusterResources> {
        let namespace = if self.base.namespace.is_empty() {
            self.renderer.config().namespace.as_str()
        } else {
            self.base.namespace.as_str()
        };
        self.renderer.render(&self.serving_topology(), namespace)
    }

    /// Visualization of the serving topology, base version and active flows
    pub fn view(&self) -> TopologyView {
        let mut active = vec![self.renderer.config().base_version.clone()];
        active.extend(self.flow_ids().into_iter().map(str::to_string));
        cluster_topology_view(&self.serving_topology(), &active)
    }

    fn activate(&mut self, flow: ActiveFlow) -> &ClusterTopology {
        info!(tenant = %self.tenant_id, flow_id = %flow.patch.flow_id, "flow created");
        let idx = self.flows.len();
        self.flows.push(flow);
        &self.flows[idx].topology
    }

    fn position(&self, flow_id: &str) -> Option<usize> {
        self.flows.iter().position(|f| f.patch.flow_id == flow_id)
    }
}

/// Shared handle to one tenant
pub type SharedTenant = Arc<Mutex<TenantContext>>;

/// All tenants, each behind its own lock
pub struct TenantRegistry {
    tenants: DashMap<String, SharedTenant>,
    executor: Arc<dyn PluginExecutor>,
    config: EngineConfig,
}

impl TenantRegistry {
    /// Create an empty registry. Every tenant gets its own plugin runner over
    /// `executor`, so plugin instance ids never collide across tenants.
    pub fn new(executor: Arc<dyn PluginExecutor>, config: EngineConfig) -> Self {
        Self {
            tenants: DashMap::new(),
            executor,
            config,
        }
    }

    /// Register (or replace) a tenant's base topology
    pub fn register(&self, tenant_id: &str, base: ClusterTopology) -> SharedTenant {
        let runner = PluginRunner::new(self.executor.clone(), self.config.plugin_timeout());
        let tenant = Arc::new(Mutex::new(TenantContext::new(
            tenant_id,
            base,
            runner,
            self.config.clone(),
        )));
        self.tenants.insert(tenant_id.to_string(), tenant.clone());
        info!(tenant = %tenant_id, "registered tenant");
        tenant
    }

    /// Look up a tenant
    pub fn get(&self, tenant_id: &str) -> Result<SharedTenant> {
        self.tenants
            .get(tenant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("tenant", tenant_id, "tenant lookup"))
    }

    /// Forget a tenant
    pub fn remove(&self, tenant_id: &str) -> Option<SharedTenant> {
        self.tenants.remove(tenant_id).map(|(_, tenant)| tenant)
    }

    /// Registered tenant ids, sorted
    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered tenants
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    /// Whether no tenant is registered
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::k8s;
    use crate::plugin::{MockPluginExecutor, PassthroughExecutor, PluginError, PluginOutput};
    use crate::topology::fixtures::boutique;
    use crate::topology::{PluginKind, StatefulPlugin};

    fn tenant() -> TenantContext {
        TenantContext::new(
            "acme",
            boutique(),
            PluginRunner::passthrough(),
            EngineConfig::default(),
        )
    }

    fn version_of<'a>(topology: &'a ClusterTopology, id: &str) -> Vec<&'a str> {
        topology
            .services
            .iter()
            .filter(|s| s.service_id == id)
            .map(|s| s.version.as_str())
            .collect()
    }

    #[test]
    fn flows_accumulate_in_serving_topology() {
        let mut ctx = tenant();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:dev"))
            .unwrap();
        ctx.create_flow(FlowPatch::single("dev-2", "checkoutservice", "checkout:dev"))
            .unwrap();

        assert_eq!(ctx.flow_ids(), vec!["dev-1", "dev-2"]);
        let serving = ctx.serving_topology();
        assert_eq!(version_of(&serving, "cartservice"), vec!["prod", "dev-1", "dev-2"]);
        assert_eq!(
            serving.ingresses[0].active_flow_ids,
            vec!["prod", "dev-1", "dev-2"]
        );
    }

    #[test]
    fn recreating_a_flow_replaces_it() {
        let mut ctx = tenant();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:v1"))
            .unwrap();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:v2"))
            .unwrap();

        assert_eq!(ctx.flows().len(), 1);
        let image = ctx
            .flow("dev-1")
            .and_then(|t| t.get_service("cartservice").ok())
            .and_then(|s| s.workload_spec.as_ref())
            .and_then(k8s::primary_image);
        assert_eq!(image, Some("cart:v2"));
    }

    fn flow_image<'a>(ctx: &'a TenantContext, flow_id: &str, service: &str) -> Option<&'a str> {
        ctx.flow(flow_id)
            .and_then(|t| t.get_service(service).ok())
            .and_then(|s| s.workload_spec.as_ref())
            .and_then(k8s::primary_image)
    }

    #[test]
    fn failed_replace_keeps_original_flow() {
        let mut ctx = tenant();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:v1"))
            .unwrap();

        let err = ctx
            .create_flow(FlowPatch::single("dev-1", "adservice", "ad:dev"))
            .unwrap_err();

        assert!(matches!(err, Error::NotFound { ref id, .. } if id == "adservice"));
        assert_eq!(ctx.flow_ids(), vec!["dev-1"]);
        assert_eq!(flow_image(&ctx, "dev-1", "cartservice"), Some("cart:v1"));
    }

    #[test]
    fn replace_with_failing_hook_restores_original_flow() {
        let mut executor = MockPluginExecutor::new();
        let mut calls = 0;
        executor
            .expect_create_flow()
            .times(3)
            .returning(move |_, _, workload, id, _, _| {
                calls += 1;
                if calls == 2 {
                    return Err(PluginError::Failed("no capacity".to_string()));
                }
                Ok(PluginOutput {
                    workload_spec: workload.clone(),
                    state: id.to_string(),
                })
            });
        executor
            .expect_delete_flow()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let mut base = boutique();
        for svc in &mut base.services {
            if svc.service_id == "redis-cart" {
                svc.stateful_plugins = vec![StatefulPlugin {
                    name: "redis-snapshot".to_string(),
                    service_name: "redis-cart".to_string(),
                    kind: PluginKind::Stateful,
                    args: Default::default(),
                }];
            }
        }
        let runner = PluginRunner::new(Arc::new(executor), Duration::from_secs(5));
        let mut ctx = TenantContext::new("acme", base, runner, EngineConfig::default());

        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:v1"))
            .unwrap();
        let err = ctx
            .create_flow(FlowPatch::single("dev-1", "cartservice", "cart:v2"))
            .unwrap_err();

        assert!(matches!(err, Error::PluginHook { .. }));
        assert_eq!(ctx.flow_ids(), vec!["dev-1"]);
        assert_eq!(flow_image(&ctx, "dev-1", "cartservice"), Some("cart:v1"));
        assert!(ctx.runner().has_state("dev-1-redis-cart-0"));
    }

    #[test]
    fn base_version_cannot_be_a_flow_id() {
        let mut ctx = tenant();
        let err = ctx
            .create_flow(FlowPatch::single("prod", "cartservice", "cart:dev"))
            .unwrap_err();
        assert!(matches!(err, Error::Structural { .. }));
        assert!(ctx.flows().is_empty());
    }

    #[test]
    fn failed_flow_is_not_recorded() {
        let mut ctx = tenant();
        let err = ctx
            .create_flow(FlowPatch::single("dev-1", "adservice", "ad:dev"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(ctx.flows().is_empty());
    }

    #[test]
    fn delete_unknown_flow_is_not_found() {
        let mut ctx = tenant();
        let err = ctx.delete_flow("dev-9").unwrap_err();
        assert!(matches!(err, Error::NotFound { ref id, .. } if id == "dev-9"));
    }

    #[test]
    fn deleted_flow_leaves_serving_topology() {
        let mut ctx = tenant();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:dev"))
            .unwrap();
        ctx.delete_flow("dev-1").unwrap();

        assert_eq!(ctx.serving_topology().services, ctx.base().services);
        assert!(ctx.render().unwrap().deployments.len() == 7);
    }

    #[test]
    fn view_lists_base_and_flow_versions() {
        let mut ctx = tenant();
        ctx.create_flow(FlowPatch::single("dev-1", "cartservice", "cart:dev"))
            .unwrap();

        let view = ctx.view();
        let cart = view.nodes.iter().find(|n| n.id == "cartservice").unwrap();
        assert_eq!(cart.versions, vec!["prod", "dev-1"]);
        let frontend = view.nodes.iter().find(|n| n.id == "frontend").unwrap();
        assert_eq!(frontend.versions, vec!["prod"]);
    }

    #[test]
    fn registry_isolates_tenants() {
        let registry = TenantRegistry::new(Arc::new(PassthroughExecutor), EngineConfig::default());
        registry.register("acme", boutique());
        registry.register("globex", boutique());

        std::thread::scope(|scope| {
            for (tenant, flow) in [("acme", "dev-a"), ("globex", "dev-g")] {
                let handle = registry.get(tenant).unwrap();
                scope.spawn(move || {
                    handle
                        .lock()
                        .create_flow(FlowPatch::single(flow, "cartservice", "cart:dev"))
                        .map(|_| ())
                });
            }
        });

        assert_eq!(registry.tenant_ids(), vec!["acme", "globex"]);
        assert_eq!(registry.get("acme").unwrap().lock().flow_ids(), vec!["dev-a"]);
        assert_eq!(registry.get("globex").unwrap().lock().flow_ids(), vec!["dev-g"]);
    }

    #[test]
    fn unknown_tenant_is_not_found() {
        let registry = TenantRegistry::new(Arc::new(PassthroughExecutor), EngineConfig::default());
        assert!(matches!(
            registry.get("nobody"),
            Err(Error::NotFound { .. })
        ));
        assert!(registry.remove("nobody").is_none());
        assert!(registry.is_empty());
    }
}
