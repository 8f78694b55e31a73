//! Plugin hook runner
//!
//! Stateful services name plugins that provision isolated backing state when
//! the service is forked into a flow (a database branch, a sidecar overlay,
//! a sandbox API key). The hooks themselves run in an out-of-process sandbox
//! behind the [`PluginExecutor`] trait; [`PluginRunner`] assigns instance ids,
//! enforces the call timeout, validates hook output and remembers the opaque
//! state each hook returned so the flow can be torn down later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::k8s::{self, DeploymentSpec, ServiceSpec};
use crate::topology::StatefulPlugin;
use crate::{Error, Result};

/// Errors reported by a plugin executor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The hook ran and reported failure
    #[error("hook failed: {0}")]
    Failed(String),
    /// The hook did not finish in time
    #[error("hook timed out after {0:?}")]
    Timeout(Duration),
    /// The hook returned output the engine cannot use
    #[error("malformed hook output: {0}")]
    Malformed(String),
}

/// Output of a create-flow hook
#[derive(Clone, Debug, PartialEq)]
pub struct PluginOutput {
    /// Workload to run for the forked service
    pub workload_spec: DeploymentSpec,
    /// Opaque state handed back to the delete hook
    pub state: String,
}

/// Executes plugin hooks in the sandbox
#[cfg_attr(test, mockall::automock)]
pub trait PluginExecutor: Send + Sync {
    /// Run the create-flow hook of `plugin`
    fn create_flow(
        &self,
        plugin: &str,
        service_spec: &ServiceSpec,
        workload_spec: &DeploymentSpec,
        plugin_id: &str,
        args: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<PluginOutput, PluginError>;

    /// Run the delete-flow hook of `plugin` with the state create-flow returned
    fn delete_flow(
        &self,
        plugin: &str,
        plugin_id: &str,
        state: &str,
        args: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> std::result::Result<(), PluginError>;
}

/// Executor that leaves workloads unchanged. Used for dry runs.
#[derive(Clone, Debug, Default)]
pub struct PassthroughExecutor;

impl PluginExecutor for PassthroughExecutor {
    fn create_flow(
        &self,
        _plugin: &str,
        _service_spec: &ServiceSpec,
        workload_spec: &DeploymentSpec,
        _plugin_id: &str,
        _args: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> std::result::Result<PluginOutput, PluginError> {
        Ok(PluginOutput {
            workload_spec: workload_spec.clone(),
            state: "{}".to_string(),
        })
    }

    fn delete_flow(
        &self,
        _plugin: &str,
        _plugin_id: &str,
        _state: &str,
        _args: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> std::result::Result<(), PluginError> {
        Ok(())
    }
}

/// Instance id of the `idx`-th plugin of a service within a flow
pub fn plugin_id(flow_id: &str, service_id: &str, idx: usize) -> String {
    format!("{flow_id}-{service_id}-{idx}")
}

/// State remembered for one created plugin instance
#[derive(Clone, Debug)]
struct PluginMemory {
    plugin: String,
    service: String,
    state: String,
    args: BTreeMap<String, String>,
}

/// Runs plugin hooks and remembers their state for teardown
pub struct PluginRunner {
    executor: Arc<dyn PluginExecutor>,
    memory: DashMap<String, PluginMemory>,
    timeout: Duration,
}

impl std::fmt::Debug for PluginRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRunner")
            .field("instances", &self.memory.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PluginRunner {
    /// Create a runner over an executor with a per-call timeout
    pub fn new(executor: Arc<dyn PluginExecutor>, timeout: Duration) -> Self {
        Self {
            executor,
            memory: DashMap::new(),
            timeout,
        }
    }

    /// Runner that never changes workloads
    pub fn passthrough() -> Self {
        Self::new(Arc::new(PassthroughExecutor), Duration::from_secs(30))
    }

    /// Run the create-flow hook and record its state under `plugin_id`.
    ///
    /// Returns the workload the forked service should run. A hook that
    /// overruns the timeout is torn down again and reported as a failure.
    pub fn create_flow(
        &self,
        plugin: &StatefulPlugin,
        service_id: &str,
        service_spec: &ServiceSpec,
        workload_spec: &DeploymentSpec,
        plugin_id: &str,
    ) -> Result<DeploymentSpec> {
        info!(plugin = %plugin.name, service = %service_id, plugin_id = %plugin_id, "running create-flow hook");

        let started = Instant::now();
        let output = self
            .executor
            .create_flow(
                &plugin.name,
                service_spec,
                workload_spec,
                plugin_id,
                &plugin.args,
                self.timeout,
            )
            .map_err(|e| Error::plugin_hook(&plugin.name, service_id, e.to_string()))?;

        if started.elapsed() > self.timeout {
            warn!(plugin = %plugin.name, plugin_id = %plugin_id, "create-flow hook overran its timeout");
            self.compensate(plugin, plugin_id, &output.state);
            return Err(Error::plugin_hook(
                &plugin.name,
                service_id,
                PluginError::Timeout(self.timeout).to_string(),
            ));
        }

        if k8s::primary_image(&output.workload_spec).is_none() {
            self.compensate(plugin, plugin_id, &output.state);
            return Err(Error::plugin_hook(
                &plugin.name,
                service_id,
                PluginError::Malformed("workload has no container image".to_string()).to_string(),
            ));
        }

        self.memory.insert(
            plugin_id.to_string(),
            PluginMemory {
                plugin: plugin.name.clone(),
                service: service_id.to_string(),
                state: output.state,
                args: plugin.args.clone(),
            },
        );
        Ok(output.workload_spec)
    }

    /// Run the delete-flow hook for a recorded plugin instance.
    ///
    /// Returns `Ok(false)` when nothing was recorded under `plugin_id`.
    pub fn delete_flow(&self, plugin_id: &str) -> Result<bool> {
        let Some((_, memory)) = self.memory.remove(plugin_id) else {
            debug!(plugin_id = %plugin_id, "no plugin state recorded, skipping delete hook");
            return Ok(false);
        };

        info!(plugin = %memory.plugin, plugin_id = %plugin_id, "running delete-flow hook");
        if let Err(e) = self.executor.delete_flow(
            &memory.plugin,
            plugin_id,
            &memory.state,
            &memory.args,
            self.timeout,
        ) {
            let err = Error::plugin_hook(&memory.plugin, &memory.service, e.to_string());
            // Keep the state so a retry can still tear it down.
            self.memory.insert(plugin_id.to_string(), memory);
            return Err(err);
        }
        Ok(true)
    }

    /// Whether state is recorded for a plugin instance
    pub fn has_state(&self, plugin_id: &str) -> bool {
        self.memory.contains_key(plugin_id)
    }

    /// Recorded plugin instance ids, sorted
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.memory.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn compensate(&self, plugin: &StatefulPlugin, plugin_id: &str, state: &str) {
        if let Err(e) =
            self.executor
                .delete_flow(&plugin.name, plugin_id, state, &plugin.args, self.timeout)
        {
            warn!(plugin = %plugin.name, plugin_id = %plugin_id, error = %e, "compensating delete-flow hook failed");
        }
    }
}
