//! Devflow - dev-in-prod flow engine for Istio service meshes
//!
//! Devflow lets a developer run a patched version of one service inside a
//! production topology without disturbing production traffic.
//!
//! # Pipeline
//!
//! ```text
//! manifests ─▶ base topology ─▶ dev flow ─▶ merged topology ─▶ mesh resources
//!              generate_base    create_dev   merge_cluster     MeshRenderer
//!              _topology        _flow        _topologies
//! ```
//!
//! Forking a service also forks everything on a path from it to a stateful
//! or external dependency, so a flow never writes to production state.
//! Requests are pinned to one flow end-to-end by trace-based sticky routing.
//!
//! # Modules
//!
//! - [`topology`] - Topology model and base topology generation
//! - [`graph`] - Dependency graph and stateful-path resolution
//! - [`flow`] - Dev-flow synthesis, teardown and topology merging
//! - [`plugin`] - Plugin hook runner for stateful services
//! - [`render`] - Kubernetes and Istio resource rendering
//! - [`trace_routing`] - Trace id propagation and destination resolution
//! - [`view`] - Node/edge view for visualization
//! - [`apply`] - Applying and pruning rendered resources
//! - [`tenant`] - Per-tenant flow state
//! - [`k8s`] - Kubernetes core types and helpers
//! - [`config`] - Engine configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod apply;
pub mod config;
pub mod error;
pub mod flow;
pub mod graph;
pub mod k8s;
pub mod plugin;
pub mod render;
pub mod telemetry;
pub mod tenant;
pub mod topology;
pub mod trace_routing;
pub mod view;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
