/// CLI Module
///
/// Command-line interface configuration using clap. Every option can also be
/// given through the environment (or a `.env` file).
use clap::Parser;
use std::time::Duration;

use crate::pipeline::ImportConfig;
use crate::rpc::NodeConfig;

/// Block Graph Importer
///
/// Import bitcoind blocks, transactions and addresses into PostgreSQL, resuming
/// from the last imported height
#[derive(Parser, Debug)]
#[command(name = "block-graph-importer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Node hostname
    #[arg(long, env = "BITCOIND_HOSTNAME", default_value = "127.0.0.1")]
    pub node_host: String,

    /// Node RPC port
    #[arg(long, env = "BITCOIND_PORT", default_value = "8332")]
    pub node_port: u16,

    /// Node RPC username
    #[arg(long, env = "BITCOIND_USERNAME", default_value = "")]
    pub node_user: String,

    /// Node RPC password
    #[arg(long, env = "BITCOIND_PASSWORD", default_value = "", hide_env_values = true)]
    pub node_password: String,

    /// Database connection URL
    #[arg(short = 'd', long, env = "DATABASE_URL", value_name = "URL")]
    pub database_url: String,

    /// Number of blocks the prefetch buffer stays ahead of the importer
    #[arg(short = 'w', long, env = "PREFETCH_WINDOW", value_name = "BLOCKS", default_value = "100")]
    pub window: u64,

    /// Only prefetch when the node is at least this many blocks ahead
    #[arg(long, env = "PREFETCH_TRIGGER_DISTANCE", value_name = "BLOCKS", default_value = "100")]
    pub trigger_distance: u64,

    /// Number of already-buffered blocks kept behind the window
    #[arg(long, env = "PREFETCH_RETENTION", value_name = "BLOCKS", default_value = "20")]
    pub retention: u64,

    /// Longest pause between two prefetch passes in seconds
    #[arg(long, env = "PREFETCH_FILL_INTERVAL", value_name = "SECONDS", default_value = "1")]
    pub fill_interval: u64,

    /// Pause between cycles once caught up, in seconds
    #[arg(short = 'i', long, env = "IMPORT_INTERVAL", value_name = "SECONDS", default_value = "10")]
    pub interval: u64,

    /// Exit as soon as the importer has caught up with the node
    #[arg(long, env = "IMPORT_ONCE")]
    pub once: bool,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            anyhow::bail!("Window must be greater than 0");
        }

        if self.trigger_distance == 0 {
            anyhow::bail!("Trigger distance must be greater than 0");
        }

        if self.interval == 0 || self.fill_interval == 0 {
            anyhow::bail!("Intervals must be greater than 0");
        }

        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            host: self.node_host.clone(),
            port: self.node_port,
            username: self.node_user.clone(),
            password: self.node_password.clone(),
        }
    }

    pub fn import_config(&self) -> ImportConfig {
        ImportConfig {
            window: self.window,
            trigger_distance: self.trigger_distance,
            retention: self.retention,
            fill_interval: Duration::from_secs(self.fill_interval),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
