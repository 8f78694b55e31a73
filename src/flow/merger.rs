//! Fold of the base topology and active flow topologies into one

use tracing::debug;

use crate::topology::{ClusterTopology, Ingress};

/// Flow id of a merged serving topology
pub const MERGED_FLOW_ID: &str = "all";

/// Merge the base topology with any number of flow topologies.
///
/// Services and edges are concatenated base first and deduplicated by full
/// value equality, keeping first-seen order. Ingresses sharing an id are
/// folded into one: active flow ids and routing rules are unioned, the
/// remaining attributes come from the first contributor.
pub fn merge_cluster_topologies(
    base: &ClusterTopology,
    flows: &[ClusterTopology],
) -> ClusterTopology {
    let mut merged = ClusterTopology {
        flow_id: MERGED_FLOW_ID.to_string(),
        namespace: base.namespace.clone(),
        ..Default::default()
    };

    for topology in std::iter::once(base).chain(flows) {
        for service in &topology.services {
            if !merged.services.contains(service) {
                merged.services.push(service.clone());
            }
        }
        for dependency in &topology.service_dependencies {
            if !merged.service_dependencies.contains(dependency) {
                merged.service_dependencies.push(dependency.clone());
            }
        }
        for ingress in &topology.ingresses {
            fold_ingress(&mut merged.ingresses, ingress);
        }
    }

    debug!(
        flows = flows.len(),
        services = merged.services.len(),
        dependencies = merged.service_dependencies.len(),
        ingresses = merged.ingresses.len(),
        "merged cluster topologies"
    );
    merged
}

fn fold_ingress(ingresses: &mut Vec<Ingress>, ingress: &Ingress) {
    let idx = match ingresses
        .iter()
        .position(|i| i.ingress_id == ingress.ingress_id)
    {
        Some(idx) => idx,
        None => {
            ingresses.push(Ingress {
                active_flow_ids: Vec::new(),
                rules: Vec::new(),
                ..ingress.clone()
            });
            ingresses.len() - 1
        }
    };
    let existing = &mut ingresses[idx];

    for flow_id in &ingress.active_flow_ids {
        if !existing.active_flow_ids.contains(flow_id) {
            existing.active_flow_ids.push(flow_id.clone());
        }
    }
    for rule in &ingress.rules {
        if !existing.rules.contains(rule) {
            existing.rules.push(rule.clone());
        }
    }
}
