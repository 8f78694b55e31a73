//! Dev flows: forking a topology for a patch and merging flows for serving
//!
//! A flow is derived from the immutable base topology by
//! [`create_dev_flow`], which forks the patched services and every service on
//! a stateful or external terminated path below them. Any number of flows are
//! combined with the base by [`merge_cluster_topologies`] into the topology
//! that is actually rendered.

mod dev_flow;
mod merger;

pub use dev_flow::{create_dev_flow, delete_dev_flow};
pub use merger::{merge_cluster_topologies, MERGED_FLOW_ID};
