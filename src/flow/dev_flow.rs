//! Dev-flow synthesis and teardown

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::graph::{find_downstream_stateful_paths, DependencyGraph};
use crate::plugin::{plugin_id, PluginRunner};
use crate::topology::{ClusterTopology, FlowPatch, PluginKind, Service, ServicePatch, ServiceRef};
use crate::{Error, Result};

const OPERATION: &str = "create dev flow";

/// Fork the patched services and their stateful blast radius into a new flow.
///
/// `reference` is used for dependency lookups and may be the merged serving
/// topology; the output is derived from `base`, which is left untouched. Every
/// service on any stateful or external terminated path from a patched service
/// is forked with `version = patch.flow_id`. Edges touching a forked service
/// are rewritten to its forked counterpart, so the result has the same service
/// and edge counts as `base`.
///
/// If a plugin hook fails, hooks that already ran for this call are torn down
/// before the error is returned.
pub fn create_dev_flow(
    runner: &PluginRunner,
    base: &ClusterTopology,
    reference: &ClusterTopology,
    patch: &FlowPatch,
) -> Result<ClusterTopology> {
    let flow_id = patch.flow_id.as_str();
    if flow_id.is_empty() {
        return Err(Error::structural(OPERATION, "flow id is empty"));
    }
    if patch.service_patches.is_empty() {
        return Err(Error::structural(
            OPERATION,
            format!("flow '{flow_id}' patches no services"),
        ));
    }

    let patches = index_patches(patch)?;
    let fork_set = blast_radius(base, reference, patch)?;
    info!(flow_id = %flow_id, services = ?fork_set, "calculated flow blast radius");

    let mut topology = base.clone();
    topology.flow_id = flow_id.to_string();
    for ingress in &mut topology.ingresses {
        ingress.active_flow_ids = vec![flow_id.to_string()];
    }

    let mut created: Vec<String> = Vec::new();
    match fork_services(runner, &mut topology, &fork_set, &patches, flow_id, &mut created) {
        Ok(renamed) => {
            for dep in &mut topology.service_dependencies {
                if let Some(forked) = renamed.get(&dep.service) {
                    dep.service = forked.clone();
                }
                if let Some(forked) = renamed.get(&dep.depends_on) {
                    dep.depends_on = forked.clone();
                }
            }
            info!(flow_id = %flow_id, forked = renamed.len(), "created dev flow");
            Ok(topology)
        }
        Err(err) => {
            warn!(flow_id = %flow_id, error = %err, hooks = created.len(), "dev flow failed, tearing down plugin state");
            for id in created.iter().rev() {
                if let Err(e) = runner.delete_flow(id) {
                    warn!(plugin_id = %id, error = %e, "teardown of plugin state failed");
                }
            }
            Err(err)
        }
    }
}

fn index_patches(patch: &FlowPatch) -> Result<HashMap<&str, &ServicePatch>> {
    let mut patches = HashMap::new();
    for service_patch in &patch.service_patches {
        if patches
            .insert(service_patch.service.as_str(), service_patch)
            .is_some()
        {
            return Err(Error::structural(
                OPERATION,
                format!(
                    "flow '{}' patches service '{}' twice",
                    patch.flow_id, service_patch.service
                ),
            ));
        }
    }
    Ok(patches)
}

/// ServiceIDs to fork, in discovery order: each patched service, the services
/// on its stateful paths, and external services named by its external plugins.
fn blast_radius(
    base: &ClusterTopology,
    reference: &ClusterTopology,
    patch: &FlowPatch,
) -> Result<Vec<String>> {
    let graph = DependencyGraph::from_topology(reference)?;
    let mut fork_set: Vec<String> = Vec::new();
    let mut add = |id: &str| {
        if !fork_set.iter().any(|f| f == id) {
            fork_set.push(id.to_string());
        }
    };

    for service_patch in &patch.service_patches {
        let target = service_patch.service.as_str();
        reference
            .get_service(target)
            .map_err(|_| Error::not_found("service", target, OPERATION))?;
        add(target);

        for path in find_downstream_stateful_paths(target, &graph, reference)? {
            for service in path {
                add(&service.service_id);
            }
        }

        let target_service = base
            .get_service(target)
            .map_err(|_| Error::not_found("service", target, OPERATION))?;
        for plugin in &target_service.stateful_plugins {
            if plugin.kind == PluginKind::External {
                base.get_service(&plugin.service_name).map_err(|_| {
                    Error::not_found("external service", &plugin.service_name, OPERATION)
                })?;
                add(&plugin.service_name);
            }
        }
    }

    for id in &fork_set {
        base.get_service(id)
            .map_err(|_| Error::not_found("service", id, OPERATION))?;
    }
    Ok(fork_set)
}

/// Fork each service in `fork_set` in place. Returns the base -> fork mapping.
fn fork_services(
    runner: &PluginRunner,
    topology: &mut ClusterTopology,
    fork_set: &[String],
    patches: &HashMap<&str, &ServicePatch>,
    flow_id: &str,
    created: &mut Vec<String>,
) -> Result<HashMap<ServiceRef, ServiceRef>> {
    let mut renamed = HashMap::new();

    for id in fork_set {
        let Some(idx) = topology.services.iter().position(|s| &s.service_id == id) else {
            return Err(Error::not_found("service", id, OPERATION));
        };
        let original = &topology.services[idx];
        let forked = fork_service(
            runner,
            original,
            patches.get(id.as_str()).copied(),
            flow_id,
            created,
        )?;
        renamed.insert(original.service_ref(), forked.service_ref());
        topology.services[idx] = forked;
    }

    Ok(renamed)
}

fn fork_service(
    runner: &PluginRunner,
    original: &Service,
    patch: Option<&ServicePatch>,
    flow_id: &str,
    created: &mut Vec<String>,
) -> Result<Service> {
    let mut forked = original.clone();
    forked.version = flow_id.to_string();

    if let Some(patch) = patch {
        let workload = forked.workload_spec.as_mut().ok_or_else(|| {
            Error::structural(
                OPERATION,
                format!("service '{}' has no workload to patch", original.service_id),
            )
        })?;
        patch.apply_to(workload)?;
        debug!(service = %original.service_id, image = %patch.image, "patched service image");

        for (idx, plugin) in original.stateful_plugins.iter().enumerate() {
            if plugin.kind != PluginKind::External {
                continue;
            }
            let id = plugin_id(flow_id, &original.service_id, idx);
            let current = forked.workload_spec.clone().unwrap_or_default();
            let next = runner.create_flow(
                plugin,
                &original.service_id,
                &original.service_spec,
                &current,
                &id,
            )?;
            created.push(id);
            forked.workload_spec = Some(next);
        }
    }

    if original.is_stateful {
        for (idx, plugin) in original.stateful_plugins.iter().enumerate() {
            if plugin.kind == PluginKind::External {
                continue;
            }
            let Some(current) = forked.workload_spec.clone() else {
                break;
            };
            let id = plugin_id(flow_id, &original.service_id, idx);
            let next = runner.create_flow(
                plugin,
                &original.service_id,
                &original.service_spec,
                &current,
                &id,
            )?;
            created.push(id);
            forked.workload_spec = Some(next);
        }
    }

    Ok(forked)
}

/// Tear down plugin state recorded for the services of a flow.
///
/// Every plugin of every service carrying `flow_id` as its version gets its
/// delete hook called. All hooks are attempted; the first failure is returned.
pub fn delete_dev_flow(
    runner: &PluginRunner,
    topology: &ClusterTopology,
    flow_id: &str,
) -> Result<()> {
    let mut first_err = None;

    for service in topology.services.iter().filter(|s| s.version == flow_id) {
        for idx in 0..service.stateful_plugins.len() {
            let id = plugin_id(flow_id, &service.service_id, idx);
            match runner.delete_flow(&id) {
                Ok(true) => debug!(plugin_id = %id, "deleted plugin state"),
                Ok(false) => {}
                Err(e) => {
                    warn!(flow_id = %flow_id, service = %service.service_id, error = %e, "failed to delete plugin state");
                    first_err.get_or_insert(e);
                }
            }
        }
    }

    info!(flow_id = %flow_id, "deleted dev flow");
    first_err.map_or(Ok(()), Err)
}
