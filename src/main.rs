//! Devflow CLI - render dev flows on top of a production topology

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use devflow::config::EngineConfig;
use devflow::graph::{find_downstream_stateful_paths, path_ids, DependencyGraph};
use devflow::plugin::{PassthroughExecutor, PluginRunner};
use devflow::telemetry::init_tracing;
use devflow::tenant::TenantContext;
use devflow::topology::{generate_base_topology, parse_manifests, ClusterTopology, FlowPatch};

/// Devflow - dev-in-prod flow engine for Istio service meshes
#[derive(Parser, Debug)]
#[command(name = "devflow", version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, global = true, env = "DEVFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to render into; overrides the config file
    #[arg(short, long, global = true, env = "DEVFLOW_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the base topology and any flows into mesh resources (YAML)
    Render(FlowArgs),

    /// Print the node/edge view of the serving topology (JSON)
    Topology(FlowArgs),

    /// Print the stateful paths downstream of a service
    Paths(PathsArgs),
}

/// Inputs shared by commands that build a serving topology
#[derive(Parser, Debug)]
struct FlowArgs {
    /// Multi-document YAML of annotated Services, Deployments and Ingresses
    #[arg(short = 'f', long)]
    manifests: PathBuf,

    /// YAML list of flow patches to create on top of the base topology
    #[arg(long)]
    flows: Option<PathBuf>,
}

/// Arguments of the paths command
#[derive(Parser, Debug)]
struct PathsArgs {
    /// Multi-document YAML of annotated Services, Deployments and Ingresses
    #[arg(short = 'f', long)]
    manifests: PathBuf,

    /// Service to start from
    service: String,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    config.validate()?;

    match cli.command {
        Commands::Render(args) => {
            let tenant = build_tenant(&args, config)?;
            print!("{}", tenant.render()?.to_yaml()?);
        }
        Commands::Topology(args) => {
            let tenant = build_tenant(&args, config)?;
            println!("{}", serde_json::to_string_pretty(&tenant.view())?);
        }
        Commands::Paths(args) => {
            let base = load_base(&args.manifests, &config)?;
            let graph = DependencyGraph::from_topology(&base)?;
            for path in find_downstream_stateful_paths(&args.service, &graph, &base)? {
                println!("{}", path_ids(&path).join(" -> "));
            }
        }
    }

    Ok(())
}

fn load_base(manifests: &Path, config: &EngineConfig) -> anyhow::Result<ClusterTopology> {
    let raw = std::fs::read_to_string(manifests)
        .with_context(|| format!("reading {}", manifests.display()))?;
    let (services, ingresses) = parse_manifests(&raw)?;
    let base = generate_base_topology(&services, &ingresses, &config.base_version, &config.namespace)?;
    Ok(base)
}

fn build_tenant(args: &FlowArgs, config: EngineConfig) -> anyhow::Result<TenantContext> {
    let base = load_base(&args.manifests, &config)?;
    let runner = PluginRunner::new(Arc::new(PassthroughExecutor), config.plugin_timeout());
    let mut tenant = TenantContext::new("cli", base, runner, config);

    if let Some(path) = &args.flows {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let patches: Vec<FlowPatch> = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing flow patches in {}", path.display()))?;
        for patch in patches {
            let flow_id = patch.flow_id.clone();
            tenant
                .create_flow(patch)
                .with_context(|| format!("creating flow '{flow_id}'"))?;
            info!(flow_id = %flow_id, "flow ready");
        }
    }

    Ok(tenant)
}
