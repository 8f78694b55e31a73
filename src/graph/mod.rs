//! Service dependency graph and stateful-path resolution
//!
//! The graph is an adjacency map keyed by ServiceID, built once per
//! resolution call from a borrowed [`ClusterTopology`]. Vertex identity is
//! the ServiceID string, so every version of a logical service collapses to
//! a single vertex; the first declared version is the representative.
//!
//! Outgoing edges keep the order in which dependencies were declared, which
//! makes [`find_downstream_stateful_paths`] deterministic.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::topology::{ClusterTopology, Service};
use crate::{Error, Result};

/// Ordered services from a start vertex to the first stateful or external
/// service on that branch, both ends inclusive
pub type StatefulPath<'a> = Vec<&'a Service>;

/// A vertex: the representative service and its outgoing edges
#[derive(Clone, Debug)]
struct Vertex<'a> {
    service: &'a Service,
    dependencies: Vec<&'a str>,
}

/// Directed dependency graph over ServiceIDs (dependant -> dependency)
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph<'a> {
    order: Vec<&'a str>,
    vertices: HashMap<&'a str, Vertex<'a>>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph for a topology.
    ///
    /// Fails with a structural error when an edge names a service that is not
    /// among the topology's vertices.
    pub fn from_topology(topology: &'a ClusterTopology) -> Result<Self> {
        let mut graph = Self::default();

        for service in &topology.services {
            let id = service.service_id.as_str();
            if !graph.vertices.contains_key(id) {
                graph.order.push(id);
                graph.vertices.insert(
                    id,
                    Vertex {
                        service,
                        dependencies: Vec::new(),
                    },
                );
            }
        }

        for dep in &topology.service_dependencies {
            let target = dep.depends_on.service_id.as_str();
            if !graph.vertices.contains_key(target) {
                return Err(Error::structural(
                    "build dependency graph",
                    format!("edge target '{target}' is not a service in the topology"),
                ));
            }
            let source = graph
                .vertices
                .get_mut(dep.service.service_id.as_str())
                .ok_or_else(|| {
                    Error::structural(
                        "build dependency graph",
                        format!(
                            "edge source '{}' is not a service in the topology",
                            dep.service.service_id
                        ),
                    )
                })?;
            if !source.dependencies.contains(&target) {
                source.dependencies.push(target);
            }
        }

        Ok(graph)
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of distinct (dependant, dependency) pairs
    pub fn edge_count(&self) -> usize {
        self.vertices.values().map(|v| v.dependencies.len()).sum()
    }

    /// Representative service of a vertex
    pub fn service(&self, service_id: &str) -> Option<&'a Service> {
        self.vertices.get(service_id).map(|v| v.service)
    }

    /// Vertex ids in declaration order
    pub fn service_ids(&self) -> &[&'a str] {
        &self.order
    }

    /// Outgoing edges of a vertex in declaration order
    pub fn dependencies(&self, service_id: &str) -> &[&'a str] {
        self.vertices
            .get(service_id)
            .map(|v| v.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Vertices with an edge into `service_id`, in declaration order
    pub fn dependants(&self, service_id: &str) -> Vec<&'a str> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.dependencies(id).contains(&service_id))
            .collect()
    }

    fn walk(
        &self,
        current: &'a str,
        path: &mut Vec<&'a Service>,
        visited: &mut HashSet<&'a str>,
        paths: &mut Vec<StatefulPath<'a>>,
    ) {
        for &next in self.dependencies(current) {
            // Per-path cycle guard: a vertex may appear in several paths but
            // only once within one.
            if visited.contains(next) {
                continue;
            }
            let Some(service) = self.service(next) else {
                continue;
            };

            path.push(service);
            if service.is_stateful_or_external() {
                paths.push(path.clone());
            } else {
                visited.insert(next);
                self.walk(next, path, visited, paths);
                visited.remove(next);
            }
            path.pop();
        }
    }
}

/// Enumerate every path from `target` to the first stateful or external
/// service on each branch.
///
/// Depth-first, following edges in declaration order. Branches that end
/// without reaching a stateful or external service contribute nothing. The
/// start vertex itself is never treated as a terminal, so a stateful target
/// still reports the paths below it.
pub fn find_downstream_stateful_paths<'a>(
    target: &str,
    graph: &DependencyGraph<'a>,
    topology: &'a ClusterTopology,
) -> Result<Vec<StatefulPath<'a>>> {
    let start = topology.get_service(target).map_err(|_| {
        Error::not_found("service", target, "find downstream stateful paths")
    })?;
    let start_id = graph
        .service_ids()
        .iter()
        .copied()
        .find(|id| *id == start.service_id)
        .ok_or_else(|| {
            Error::not_found("vertex", target, "find downstream stateful paths")
        })?;

    let mut paths = Vec::new();
    let mut path = vec![start];
    let mut visited = HashSet::from([start_id]);
    graph.walk(start_id, &mut path, &mut visited, &mut paths);

    debug!(
        target = %target,
        paths = paths.len(),
        "resolved downstream stateful paths"
    );
    Ok(paths)
}

/// ServiceIDs along a path
pub fn path_ids<'a>(path: &[&'a Service]) -> Vec<&'a str> {
    path.iter().map(|s| s.service_id.as_str()).collect()
}
