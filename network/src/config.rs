//! # Protocol Configuration & Constants
//!
//! Every magic number in Tessera lives here, next to [`NetworkConfig`],
//! the aggregate that a node is started from. Component-level configs
//! (`TransportConfig`, `PeerGroupConfig`, ...) live beside the component
//! they configure and are only gathered up here.
//!
//! Changing the wire constants below after nodes are deployed splits the
//! network in two. Changing the timeouts merely annoys people.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::DataServiceConfig;
use crate::node::NodeConfig;
use crate::peer_group::PeerGroupConfig;
use crate::transport::{TransportConfig, TransportType};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Wire protocol version exchanged in the handshake. Peers speaking a
/// different version are disconnected before any data flows.
pub const PROTOCOL_VERSION: u16 = 1;

/// Human-readable crate/protocol version, for logs and `/status`.
pub const PROTOCOL_VERSION_STRING: &str = "0.1.0";

/// Magic bytes at the start of every frame. "TSRA" in ASCII. Lets us
/// reject random traffic on the P2P port without attempting a decode.
pub const FRAME_MAGIC: [u8; 4] = *b"TSRA";

/// Largest frame we are willing to read. Data items are capped far below
/// this by their MetaData, so anything larger is garbage or an attack.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 9840;

/// Default status API port for the node binary.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default Prometheus metrics port for the node binary.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

/// Below this many connections a node advertises that it wants more peers.
pub const DEFAULT_MIN_CONNECTIONS: usize = 4;

/// Hard ceiling on live connections per node.
pub const DEFAULT_MAX_CONNECTIONS: usize = 12;

/// Maximum concurrent tasks on the network I/O pool.
pub const DEFAULT_IO_POOL_SIZE: usize = 64;

/// Tor control port of a locally running tor daemon.
pub const DEFAULT_TOR_CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Tor SOCKS5 port of a locally running tor daemon.
pub const DEFAULT_TOR_SOCKS_ADDR: &str = "127.0.0.1:9050";

/// SAM bridge of a locally running I2P router (enable SAM in the router
/// console first; the bridge takes a minute or two to come up).
pub const DEFAULT_SAM_ADDR: &str = "127.0.0.1:7656";

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Substrate initialization timeout. I2P tunnel building can take minutes.
pub const TRANSPORT_INIT_TIMEOUT: Duration = Duration::from_secs(180);

/// Outbound connection timeout. Generous because of hidden-service lookups.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Time allowed for the handshake exchange on a fresh socket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for writing a single frame to a peer.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall deadline for bringing a whole node up.
pub const NODE_INIT_DEADLINE: Duration = Duration::from_secs(300);

/// How far in the future a `created_at` timestamp may lie before the item
/// is rejected. Clocks on anonymity-network hosts are not great.
pub const MAX_FUTURE_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// Interval of the periodic TTL sweep over all stores.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for in-flight I/O tasks on shutdown before they are aborted.
pub const IO_POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Anti-spam
// ---------------------------------------------------------------------------

/// Default hashcash difficulty (leading zero bits) for published items.
pub const DEFAULT_POW_DIFFICULTY: u8 = 8;

/// Upper bound on accepted difficulty. Prevents a peer from asking us to
/// burn CPU on absurd targets.
pub const MAX_POW_DIFFICULTY: u8 = 24;

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io_pool_size {io_pool_size} leaves no room for {max_connections} connections; need at least {required}")]
    PoolTooSmall {
        io_pool_size: usize,
        max_connections: usize,
        required: usize,
    },
}

/// Everything needed to start one node.
///
/// All fields have defaults, so a JSON config file only needs to mention
/// what it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Logical node identifier. Used as the Tor key directory name and as
    /// part of the I2P session id.
    pub node_id: String,
    /// Which substrate this node runs on.
    pub transport_type: TransportType,
    /// Port to listen on. `0` lets the OS pick (clear transport only).
    pub port: u16,
    /// Substrate-specific settings.
    pub transport: TransportConfig,
    /// Node runtime timeouts.
    pub node: NodeConfig,
    /// Connection targets.
    pub peer_group: PeerGroupConfig,
    /// Storage and dissemination policy.
    pub data: DataServiceConfig,
    /// Maximum concurrent tasks on the I/O pool.
    pub io_pool_size: usize,
    /// Overall deadline for [`crate::ServiceNode::start`], in milliseconds.
    pub init_deadline_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_id: "default".to_string(),
            transport_type: TransportType::Clear,
            port: DEFAULT_P2P_PORT,
            transport: TransportConfig::default(),
            node: NodeConfig::default(),
            peer_group: PeerGroupConfig::default(),
            data: DataServiceConfig::default(),
            io_pool_size: DEFAULT_IO_POOL_SIZE,
            init_deadline_ms: NODE_INIT_DEADLINE.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The I/O pool must fit one send per connection plus a dial and a
    /// substrate operation, or a broadcast to a full peer group queues
    /// behind itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_connections = self.peer_group.max_connections;
        let required = max_connections + 3;
        if self.io_pool_size < required {
            return Err(ConfigError::PoolTooSmall {
                io_pool_size: self.io_pool_size,
                max_connections,
                required,
            });
        }
        Ok(())
    }

    /// The overall initialization deadline as a `Duration`.
    pub fn init_deadline(&self) -> Duration {
        Duration::from_millis(self.init_deadline_ms)
    }
}
