//! Simplified node/edge view of a topology for visualization

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::topology::ClusterTopology;

/// Kind of a view node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Ingress point
    Gateway,
    /// Ordinary service
    Service,
    /// Third-party dependency outside the cluster
    External,
    /// Service holding state
    Stateful,
}

/// One logical service or ingress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// ServiceID or ingress id
    pub id: String,
    /// Display label
    pub label: String,
    /// Node kind
    #[serde(rename = "type")]
    pub type_: NodeType,
    /// Active versions (flow ids for an ingress)
    pub versions: Vec<String>,
}

/// Directed edge between two node ids
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Caller
    pub source: String,
    /// Callee
    pub target: String,
}

/// Nodes and edges
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyView {
    /// One node per ServiceID, then one per ingress
    pub nodes: Vec<Node>,
    /// Deduplicated dependency edges, then ingress edges
    pub edges: Vec<Edge>,
}

/// Build the view of `topology` restricted to `active_flows`.
///
/// Versions not listed in `active_flows` are left out of a node's version
/// list; the node itself is kept so the graph shape stays stable.
pub fn cluster_topology_view(topology: &ClusterTopology, active_flows: &[String]) -> TopologyView {
    let is_active = |version: &str| active_flows.iter().any(|f| f == version);

    let mut nodes: Vec<Node> = topology
        .service_ids()
        .into_iter()
        .map(|id| {
            let versions: Vec<&_> = topology
                .services
                .iter()
                .filter(|s| s.service_id == id)
                .collect();
            let type_ = match versions.first() {
                Some(s) if s.is_external => NodeType::External,
                Some(s) if s.is_stateful => NodeType::Stateful,
                _ => NodeType::Service,
            };
            Node {
                id: id.to_string(),
                label: id.to_string(),
                type_,
                versions: versions
                    .iter()
                    .map(|s| s.version.as_str())
                    .filter(|v| is_active(v))
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect();

    let mut seen = HashSet::new();
    let mut edges: Vec<Edge> = topology
        .service_dependencies
        .iter()
        .map(|d| Edge {
            source: d.service.service_id.clone(),
            target: d.depends_on.service_id.clone(),
        })
        .filter(|e| seen.insert(e.clone()))
        .collect();

    for ingress in &topology.ingresses {
        nodes.push(Node {
            id: ingress.ingress_id.clone(),
            label: ingress.host().unwrap_or(ingress.ingress_id.as_str()).to_string(),
            type_: NodeType::Gateway,
            versions: ingress
                .active_flow_ids
                .iter()
                .filter(|f| is_active(f))
                .cloned()
                .collect(),
        });
        for target in ingress.target_services() {
            let edge = Edge {
                source: ingress.ingress_id.clone(),
                target: target.to_string(),
            };
            if seen.insert(edge.clone()) {
                edges.push(edge);
            }
        }
    }

    TopologyView { nodes, edges }
}
