use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgelake_core::{config::NodeConfig, matcher::MatchDefinition, util::file_read};
use edgelake_services::{
    memory::{AllowListDomains, Manifest, MemoryAssets, MemoryNaming, NullEngine},
    Collaborators, Node,
};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

mod report;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the node config file, defaults apply when omitted
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Path of the deployment manifest
    #[clap(short, long, value_parser)]
    manifest: PathBuf,
    /// Directory of asset files named by content address
    #[clap(short, long, value_parser)]
    assets: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse config and manifest
    Check,
    /// Resolve a request to a single serviceable
    Resolve {
        #[clap(long)]
        host: Option<String>,
        #[clap(long, default_value = "/")]
        path: String,
        #[clap(long, default_value = "GET")]
        method: String,
        #[clap(long)]
        project: Option<String>,
        #[clap(long, default_value = "")]
        application: String,
        #[clap(long)]
        channel: Option<String>,
    },
    /// Resolve and serve a website request from the asset directory
    Fetch {
        #[clap(long)]
        host: String,
        #[clap(long, default_value = "/")]
        path: String,
    },
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    let manifest: Manifest = {
        let content = file_read(&args.manifest)
            .await
            .with_context(|| format!("reading manifest {}", args.manifest.display()))?;
        edgelake_core::config::parse_from_slice(&content)?
    };
    let naming = MemoryNaming::from_manifest(&manifest)?;
    let assets = match &args.assets {
        Some(dir) => MemoryAssets::from_dir(dir)
            .with_context(|| format!("loading assets from {}", dir.display()))?,
        None => MemoryAssets::default(),
    };
    tracing::info!(
        "loaded {} deployment(s), {} naming object(s), {} asset(s)",
        manifest.deployments.len(),
        naming.len(),
        assets.len()
    );

    let node = Node::new(
        Collaborators {
            naming: Arc::new(naming),
            assets: Arc::new(assets),
            engine: Arc::new(NullEngine),
            domains: Arc::new(AllowListDomains::allow_all()),
            plugins: Vec::new(),
        },
        config,
    )?;

    let result = run(&node, args.command).await;
    node.shutdown();
    result
}

async fn run(node: &Node, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            let pool = &node.context().config().pool;
            println!(
                "config ok: shadow_buff={} instance_max_requests={} max_global_instances={}",
                pool.shadow_buff, pool.instance_max_requests, pool.max_global_instances
            );
        }
        Command::Resolve {
            host,
            path,
            method,
            project,
            application,
            channel,
        } => {
            let matcher = match (host, project, channel) {
                (Some(host), _, _) => MatchDefinition::http(host, path, method),
                (None, Some(project), Some(channel)) => {
                    MatchDefinition::pubsub(project, application, channel)
                }
                _ => anyhow::bail!("resolve needs --host, or --project with --channel"),
            };
            let pick = node.lookup(&matcher).await?;
            report::print(&report::Pick::new(&pick, &matcher))?;
        }
        Command::Fetch { host, path } => {
            let matcher = MatchDefinition::http(host, path, "GET");
            let handled = node.serve(&matcher, 0).await?;
            report::print(&report::Served::new(&handled))?;
        }
    }
    Ok(())
}
