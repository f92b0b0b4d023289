//! # Transport Abstraction
//!
//! One contract, three substrates. Everything above this module asks for
//! "a listening socket for node X on port P" or "a socket to address A"
//! and never learns whether the answer came from a plain TCP bind, a Tor
//! hidden service published through the control port, or an I2P SAM
//! session that took two minutes to build its tunnels.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs    — Transport trait, Address, errors, ServerSocket, config
//! clear.rs  — plain TCP
//! tor.rs    — Tor control-port client + hidden services, dials via socks.rs
//! socks.rs  — minimal SOCKS5 CONNECT client
//! i2p.rs    — I2P transport on top of sam.rs
//! sam.rs    — SAM v3 bridge line protocol
//! ```
//!
//! ## Contract
//!
//! - `initialize` is idempotent and reports failure instead of hiding it.
//! - `get_server_socket` returns the substrate-assigned address (onion
//!   address, I2P destination) where the substrate assigns one. Portless
//!   substrates use [`Address::NO_PORT`].
//! - `get_connection` reports failures as values.
//! - `shutdown` is idempotent, safe before `initialize`, and leaves the
//!   transport re-initializable. Until then every call fails with
//!   [`TransportError::NotInitialized`] without touching the network.
//! - `get_server_address` is best effort and returns `None` on failure.
//! - `ServerSocket::accept` never reads from the socket. Substrate
//!   preambles are consumed by [`PendingSocket::resolve`] on the
//!   connection's own task.
//!
//! Slow substrate work (handshakes, dials) runs on the shared
//! [`IoPool`] under a timeout, never on the caller's task.

mod clear;
mod i2p;
mod sam;
mod socks;
mod tor;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::config;
use crate::io_pool::{IoPool, IoPoolError};

pub use clear::ClearTransport;
pub use i2p::I2pTransport;
pub use tor::TorTransport;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A network address on any substrate: hostname or IP, onion address, or
/// I2P destination, plus a port where the substrate has ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: i32,
}

impl Address {
    /// Port sentinel for substrates without ports (I2P).
    pub const NO_PORT: i32 = -1;

    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An address on a portless substrate.
    pub fn portless(host: impl Into<String>) -> Self {
        Self::new(host, Self::NO_PORT)
    }

    /// `127.0.0.1:<port>`, the usual clear-net test address.
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", i32::from(port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    /// The port as a `u16`, if the address has a usable one.
    pub fn tcp_port(&self) -> Option<u16> {
        u16::try_from(self.port).ok()
    }

    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    /// Parses `host:port`. A string without a colon is a portless address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<i32>()
                    .map_err(|_| TransportError::Protocol(format!("invalid port in '{}'", s)))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(TransportError::Protocol(format!("missing host in '{}'", s))),
            None if !s.is_empty() => Ok(Self::portless(s)),
            None => Err(TransportError::Protocol("empty address".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportType
// ---------------------------------------------------------------------------

/// The substrate a transport runs on. Chosen per node at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Clear,
    Tor,
    I2p,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clear => "clear",
            Self::Tor => "tor",
            Self::I2p => "i2p",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clear" | "tcp" => Ok(Self::Clear),
            "tor" => Ok(Self::Tor),
            "i2p" => Ok(Self::I2p),
            other => Err(TransportError::Protocol(format!(
                "unknown transport type '{}'",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The substrate session could not be established.
    #[error("transport initialization failed: {0}")]
    Initialization(String),

    /// A specific connect or accept attempt failed.
    #[error("connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },

    /// `initialize` has not completed, or `shutdown` has been called.
    #[error("transport is not initialized")]
    NotInitialized,

    /// A substrate operation exceeded its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// The substrate answered with something we did not expect.
    #[error("substrate protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("io pool error: {0}")]
    Pool(#[from] IoPoolError),
}

impl TransportError {
    pub(crate) fn connection(address: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Connection {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server sockets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptMode {
    /// Accepted sockets carry application bytes from the first byte on.
    Plain,
    /// Accepted sockets start with a SAM header line naming the peer's
    /// destination.
    SamForwarded,
}

/// A bound listening endpoint returned by [`Transport::get_server_socket`].
#[derive(Debug)]
pub struct ServerSocket {
    listener: TcpListener,
    mode: AcceptMode,
}

/// An inbound socket straight off the listener. Nothing has been read
/// from it yet; [`PendingSocket::resolve`] does that on the connection's
/// own task.
#[derive(Debug)]
pub struct PendingSocket {
    stream: TcpStream,
    peer: SocketAddr,
    mode: AcceptMode,
}

impl PendingSocket {
    /// Reads whatever substrate preamble precedes the peer's first frame
    /// and reports the remote identity. Unbounded; callers apply their own
    /// deadline.
    pub async fn resolve(self) -> Result<AcceptedSocket, TransportError> {
        let Self {
            mut stream,
            peer,
            mode,
        } = self;
        match mode {
            AcceptMode::Plain => Ok(AcceptedSocket {
                stream,
                remote: Some(peer.to_string()),
            }),
            AcceptMode::SamForwarded => {
                let header = sam::read_line(&mut stream).await?;
                let remote = header.split_whitespace().next().map(str::to_string);
                Ok(AcceptedSocket { stream, remote })
            }
        }
    }
}

/// An inbound socket positioned at the peer's first frame.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub stream: TcpStream,
    /// Substrate-level remote identity when the substrate reveals one
    /// (I2P destination, or the TCP peer address on clear net).
    pub remote: Option<String>,
}

impl ServerSocket {
    fn plain(listener: TcpListener) -> Self {
        Self {
            listener,
            mode: AcceptMode::Plain,
        }
    }

    fn sam_forwarded(listener: TcpListener) -> Self {
        Self {
            listener,
            mode: AcceptMode::SamForwarded,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next inbound socket. Returns as soon as the listener
    /// hands one over.
    pub async fn accept(&self) -> Result<PendingSocket, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(PendingSocket {
            stream,
            peer,
            mode: self.mode,
        })
    }
}

/// Result of [`Transport::get_server_socket`].
#[derive(Debug)]
pub struct ServerSocketResult {
    pub node_id: String,
    pub server_socket: ServerSocket,
    pub address: Address,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// The substrate-agnostic transport contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which substrate this is.
    fn transport_type(&self) -> TransportType;

    /// Establishes the substrate session. Idempotent.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Binds a listening endpoint for `node_id`.
    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, TransportError>;

    /// Opens an outbound socket to `address`.
    async fn get_connection(&self, address: &Address) -> Result<TcpStream, TransportError>;

    /// Releases every resource held by this transport. Idempotent.
    async fn shutdown(&self);

    /// Best-effort lookup of the address bound for `server_id`.
    fn get_server_address(&self, server_id: &str) -> Option<Address>;

    /// Whether `initialize` has completed and `shutdown` has not been called.
    fn is_initialized(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tor daemon endpoints and authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub control_addr: String,
    pub socks_addr: String,
    /// `HashedControlPassword` secret, if the daemon uses one.
    pub control_password: Option<String>,
    /// Path of the control auth cookie, if the daemon uses cookie auth.
    pub cookie_file: Option<PathBuf>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            control_addr: config::DEFAULT_TOR_CONTROL_ADDR.to_string(),
            socks_addr: config::DEFAULT_TOR_SOCKS_ADDR.to_string(),
            control_password: None,
            cookie_file: None,
        }
    }
}

/// I2P router SAM bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct I2pConfig {
    pub sam_addr: String,
    /// Destination signature type. 7 is EdDSA-SHA512-Ed25519.
    pub signature_type: u8,
}

impl Default for I2pConfig {
    fn default() -> Self {
        Self {
            sam_addr: config::DEFAULT_SAM_ADDR.to_string(),
            signature_type: 7,
        }
    }
}

/// Settings shared by all transports plus the substrate-specific blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Directory for persisted substrate keys (onion keys, I2P destinations).
    pub base_dir: PathBuf,
    /// Host the clear transport binds to and advertises.
    pub bind_host: String,
    pub init_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub tor: TorConfig,
    pub i2p: I2pConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("tessera"),
            bind_host: "127.0.0.1".to_string(),
            init_timeout_ms: config::TRANSPORT_INIT_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: config::CONNECT_TIMEOUT.as_millis() as u64,
            tor: TorConfig::default(),
            i2p: I2pConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Builds the transport variant for `transport_type`.
pub fn create_transport(
    transport_type: TransportType,
    config: TransportConfig,
    io_pool: Arc<IoPool>,
) -> Arc<dyn Transport> {
    match transport_type {
        TransportType::Clear => Arc::new(ClearTransport::new(config, io_pool)),
        TransportType::Tor => Arc::new(TorTransport::new(config, io_pool)),
        TransportType::I2p => Arc::new(I2pTransport::new(config, io_pool)),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Aborts the wrapped pool task if the awaiting caller goes away, so a
/// dropped connect attempt does not leave a half-built session behind.
struct CancelOnDrop(tokio::task::AbortHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `work` on the I/O pool under `timeout`. The deadline starts at
/// submission, so time spent waiting for a pool permit counts.
pub(crate) async fn run_on_pool<F, T>(
    io_pool: &IoPool,
    timeout: Duration,
    operation: &'static str,
    work: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>> + Send + 'static,
    T: Send + 'static,
{
    let task = io_pool.spawn(work)?;
    let _cancel = CancelOnDrop(task.abort_handle());
    match tokio::time::timeout(timeout, task).await {
        Ok(result) => result?,
        Err(_) => Err(TransportError::Timeout {
            operation,
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Reads a persisted substrate key, if one exists.
pub(crate) async fn read_key_file(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let key = raw.trim().to_string();
    (!key.is_empty()).then_some(key)
}

/// Persists a substrate key, creating parent directories.
pub(crate) async fn write_key_file(path: &Path, key: &str) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
