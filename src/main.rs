use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use hypersearch::cli::{Cli, Commands};
use hypersearch::config::{ClusterConfig, ClusterConfigBuilder};
use hypersearch::hypercube;
use hypersearch::node::SearchNode;
use hypersearch::transport::InMemoryNetwork;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { address, node_id, data_dir, preset, config, peers } => {
            cmd_start(address, node_id, data_dir, &preset, config, peers)
        }
        Commands::CheckConfig { config, preset } => cmd_check_config(config, &preset, cli.json),
    }
}

fn load_config(preset: &str, path: Option<PathBuf>) -> Result<ClusterConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            ClusterConfig::from_json(&text)?
        }
        None => ClusterConfigBuilder::from_preset(preset).build()?,
    };
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }
    Ok(config)
}

fn cmd_start(
    address: String,
    node_id: Option<u64>,
    data_dir: Option<PathBuf>,
    preset: &str,
    config_path: Option<PathBuf>,
    peers: Vec<u64>,
) -> Result<()> {
    let config = load_config(preset, config_path)?;
    let node_id =
        node_id.unwrap_or_else(|| hypercube::node_id_from_seed(&address, config.overlay.dimensions));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let network = InMemoryNetwork::new();
        let inbox = network.register(node_id);
        let node = SearchNode::new(
            node_id,
            address,
            config,
            Arc::new(network),
            data_dir,
        )?;

        for peer in peers {
            node.add_seed_peer(peer);
        }

        node.start(inbox);
        if let Err(e) = node.bootstrap().await {
            log::warn!("bootstrap incomplete: {}", e);
        }
        log::info!(
            "node {} ready (role: {})",
            node.node_id(),
            node.raft().role()
        );

        wait_for_signal().await;
        node.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = sigterm.recv() => log::info!("received SIGTERM"),
    }
}

fn cmd_check_config(config_path: Option<PathBuf>, preset: &str, json: bool) -> Result<()> {
    let config = load_config(preset, config_path)?;
    if json {
        println!("{}", config.to_json());
    } else {
        println!("configuration OK");
        println!(
            "  replication: k={} w={} r={}",
            config.replication.replication_factor,
            config.replication.min_replicas_for_write,
            config.replication.read_quorum
        );
        println!(
            "  consensus: election {}..{}ms, heartbeat {}ms",
            config.consensus.election_timeout_min_ms,
            config.consensus.election_timeout_max_ms,
            config.consensus.heartbeat_interval_ms
        );
        println!(
            "  overlay: {} dims, {} shards x {} vnodes",
            config.overlay.dimensions, config.overlay.num_shards, config.overlay.virtual_nodes
        );
    }
    Ok(())
}
