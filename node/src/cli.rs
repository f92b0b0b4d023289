//! # CLI Interface
//!
//! Command-line arguments for `tessera-node`, via `clap` derive. Three
//! subcommands: `run`, `publish` and `version`.
//!
//! Node settings come from an optional JSON config file; any flag given
//! on the command line (or through its environment variable) overrides
//! the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use tessera_network::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};
use tessera_network::{Address, NetworkConfig, TransportType};

use crate::logging::LogFormat;

/// Tessera P2P data node.
///
/// Stores self-authenticating data items and floods them to its peers
/// over clear TCP, Tor or I2P.
#[derive(Parser, Debug)]
#[command(
    name = "tessera-node",
    about = "Tessera P2P data node",
    version,
    propagate_version = true
)]
pub struct TesseraNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and keep it running until interrupted.
    Run(RunArgs),
    /// Start a node, publish one text note to the network, and exit.
    Publish(PublishArgs),
    /// Print version information and exit.
    Version,
}

/// Settings shared by every subcommand that starts a node.
#[derive(Args, Debug)]
pub struct NodeArgs {
    /// JSON configuration file. Flags override its values.
    #[arg(long, short = 'c', env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Identifier of this node. Also names its persisted substrate keys.
    #[arg(long, env = "TESSERA_NODE_ID")]
    pub node_id: Option<String>,

    /// Transport substrate: clear, tor or i2p.
    #[arg(long, short = 't', env = "TESSERA_TRANSPORT")]
    pub transport: Option<TransportType>,

    /// Port for P2P connections (the virtual port for Tor and I2P).
    #[arg(long, short = 'p', env = "TESSERA_P2P_PORT")]
    pub port: Option<u16>,

    /// Directory for persisted onion keys and I2P destinations.
    #[arg(long, env = "TESSERA_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Peers to connect to on startup, as `host:port` (repeatable).
    #[arg(long = "seed", short = 's', env = "TESSERA_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<Address>,

    /// Proof-of-work difficulty required of every item.
    #[arg(long, env = "TESSERA_POW_DIFFICULTY")]
    pub pow_difficulty: Option<u8>,

    /// Log output format: pretty or json.
    #[arg(long, env = "TESSERA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl NodeArgs {
    /// The effective configuration: file (or defaults), then flags.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let mut config = match &self.config {
            Some(path) => NetworkConfig::from_json_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => NetworkConfig::default(),
        };
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(transport) = self.transport {
            config.transport_type = transport;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(base_dir) = &self.base_dir {
            config.transport.base_dir = base_dir.clone();
        }
        if let Some(difficulty) = self.pow_difficulty {
            config.data.pow_difficulty = difficulty;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_str_lossy(&self.log_format)
    }
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Port for the HTTP status API.
    #[arg(long, env = "TESSERA_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "TESSERA_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Hex-encoded Ed25519 secret key used for notes published over the API.
    ///
    /// A fresh key is generated when omitted.
    #[arg(long, env = "TESSERA_KEY")]
    pub key: Option<String>,
}

/// Arguments for the `publish` subcommand.
#[derive(Args, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Text of the note.
    #[arg(long)]
    pub text: String,

    /// Hex-encoded Ed25519 secret key of the publisher.
    #[arg(long, env = "TESSERA_KEY")]
    pub key: Option<String>,

    /// How long to wait for seed connections before publishing, in ms.
    #[arg(long, default_value_t = 2_000)]
    pub settle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        TesseraNodeCli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TesseraNodeCli::parse_from([
            "tessera-node",
            "run",
            "--node-id",
            "alice",
            "--transport",
            "tor",
            "--port",
            "7000",
            "--seed",
            "127.0.0.1:9000,127.0.0.1:9001",
            "--pow-difficulty",
            "12",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.node.seeds.len(), 2);

        let config = args.node.network_config().unwrap();
        assert_eq!(config.node_id, "alice");
        assert_eq!(config.transport_type, TransportType::Tor);
        assert_eq!(config.port, 7000);
        assert_eq!(config.data.pow_difficulty, 12);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = TesseraNodeCli::parse_from([
            "tessera-node",
            "publish",
            "--text",
            "hi",
            "--config",
            "/nonexistent/tessera.json",
        ]);
        let Commands::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert!(args.node.network_config().is_err());
    }
}
