use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hypersearch", about = "Distributed document search node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable output where supported
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a cluster node and serve until SIGINT/SIGTERM
    Start {
        /// Stable node address used to derive the node id, e.g. host:port
        #[arg(long)]
        address: String,

        /// Explicit node id (derived from the address when omitted)
        #[arg(long)]
        node_id: Option<u64>,

        /// Directory for persisted state (raft/, index/, ap_store/)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Configuration preset: production, development or testing
        #[arg(long, default_value = "production")]
        preset: String,

        /// JSON configuration file overriding the preset
        #[arg(long)]
        config: Option<PathBuf>,

        /// Known peer node ids to seed consensus membership
        #[arg(long, value_delimiter = ',')]
        peers: Vec<u64>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "production")]
        preset: String,
    },
}
