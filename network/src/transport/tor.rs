//! # Tor Transport
//!
//! Talks to an already running tor daemon. Nothing here embeds tor.
//!
//! - **initialize**: opens the control port and authenticates (password,
//!   cookie file, or null auth, in that order of preference).
//! - **get_server_socket**: binds a local listener on 127.0.0.1 and
//!   publishes a v3 hidden service forwarding `<onion>:port` to it with
//!   `ADD_ONION`. The service key is persisted under
//!   `<base_dir>/tor/<node_id>/hs_ed25519` so a node keeps its onion
//!   address across restarts.
//! - **get_connection**: SOCKS5 CONNECT through tor's SOCKS port.
//! - **shutdown**: closes the control connection. Tor removes every
//!   non-detached onion service owned by it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    read_key_file, run_on_pool, socks, write_key_file, Address, ServerSocket,
    ServerSocketResult, TorConfig, Transport, TransportConfig, TransportError, TransportType,
};
use crate::io_pool::IoPool;

const NEW_V3_KEY: &str = "NEW:ED25519-V3";

// ---------------------------------------------------------------------------
// Control-port client
// ---------------------------------------------------------------------------

/// A published onion service as reported by `ADD_ONION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OnionService {
    pub service_id: String,
    /// Only present when tor generated a fresh key.
    pub private_key: Option<String>,
}

/// A tor control-port connection (control-spec section 2).
pub(crate) struct TorControl {
    stream: BufStream<TcpStream>,
}

impl TorControl {
    pub(crate) async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            TransportError::Initialization(format!("tor control port {}: {}", addr, e))
        })?;
        Ok(Self {
            stream: BufStream::new(stream),
        })
    }

    /// Sends one command and collects the reply lines (without status
    /// codes). Any non-2xx status turns into an error.
    pub(crate) async fn command(&mut self, line: &str) -> Result<Vec<String>, TransportError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        let mut lines = Vec::new();
        let mut failure: Option<String> = None;
        loop {
            let raw = self.read_raw_line().await?;
            if raw.len() < 4 {
                return Err(TransportError::Protocol(format!(
                    "malformed tor reply line '{}'",
                    raw
                )));
            }
            let (code, rest) = raw.split_at(3);
            let separator = rest.as_bytes()[0];
            let body = rest[1..].to_string();

            if !code.starts_with('2') && failure.is_none() {
                failure = Some(format!("{} {}", code, body));
            }
            match separator {
                b' ' => {
                    lines.push(body);
                    break;
                }
                b'-' => lines.push(body),
                b'+' => {
                    // Data reply: lines until a lone ".".
                    lines.push(body);
                    loop {
                        let data = self.read_raw_line().await?;
                        if data == "." {
                            break;
                        }
                        lines.push(data);
                    }
                }
                _ => {
                    return Err(TransportError::Protocol(format!(
                        "malformed tor reply line '{}'",
                        raw
                    )))
                }
            }
        }

        match failure {
            Some(message) => Err(TransportError::Protocol(format!("tor replied {}", message))),
            None => Ok(lines),
        }
    }

    async fn read_raw_line(&mut self) -> Result<String, TransportError> {
        let mut raw = String::new();
        if self.stream.read_line(&mut raw).await? == 0 {
            return Err(TransportError::Protocol(
                "tor control connection closed".to_string(),
            ));
        }
        Ok(raw.trim_end_matches(['\r', '\n']).to_string())
    }

    pub(crate) async fn authenticate(&mut self, tor: &TorConfig) -> Result<(), TransportError> {
        let command = if let Some(password) = &tor.control_password {
            let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
            format!("AUTHENTICATE \"{}\"", escaped)
        } else if let Some(cookie_file) = &tor.cookie_file {
            let cookie = tokio::fs::read(cookie_file).await.map_err(|e| {
                TransportError::Initialization(format!(
                    "cannot read tor cookie {}: {}",
                    cookie_file.display(),
                    e
                ))
            })?;
            format!("AUTHENTICATE {}", hex::encode(cookie))
        } else {
            "AUTHENTICATE".to_string()
        };

        self.command(&command)
            .await
            .map_err(|e| TransportError::Initialization(format!("tor authentication: {}", e)))?;
        Ok(())
    }

    /// Publishes an onion service mapping `virtual_port` to `target`.
    pub(crate) async fn add_onion(
        &mut self,
        key_spec: &str,
        virtual_port: u16,
        target: SocketAddr,
    ) -> Result<OnionService, TransportError> {
        let lines = self
            .command(&format!(
                "ADD_ONION {} Port={},{}",
                key_spec, virtual_port, target
            ))
            .await?;

        let mut service_id = None;
        let mut private_key = None;
        for line in lines {
            if let Some(id) = line.strip_prefix("ServiceID=") {
                service_id = Some(id.to_string());
            } else if let Some(key) = line.strip_prefix("PrivateKey=") {
                private_key = Some(key.to_string());
            }
        }

        let service_id = service_id.ok_or_else(|| {
            TransportError::Protocol("ADD_ONION reply carried no ServiceID".to_string())
        })?;
        Ok(OnionService {
            service_id,
            private_key,
        })
    }
}

// ---------------------------------------------------------------------------
// TorTransport
// ---------------------------------------------------------------------------

pub struct TorTransport {
    config: TransportConfig,
    io_pool: Arc<IoPool>,
    initialized: AtomicBool,
    control: Arc<Mutex<Option<TorControl>>>,
    servers: RwLock<HashMap<String, Address>>,
}

impl TorTransport {
    pub fn new(config: TransportConfig, io_pool: Arc<IoPool>) -> Self {
        Self {
            config,
            io_pool,
            initialized: AtomicBool::new(false),
            control: Arc::new(Mutex::new(None)),
            servers: RwLock::new(HashMap::new()),
        }
    }

    fn key_path(&self, node_id: &str) -> PathBuf {
        self.config
            .base_dir
            .join("tor")
            .join(node_id)
            .join("hs_ed25519")
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }
}

#[async_trait]
impl Transport for TorTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Tor
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let mut guard = self.control.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let tor = self.config.tor.clone();
        let control = run_on_pool(
            &self.io_pool,
            self.config.init_timeout(),
            "tor initialization",
            async move {
                let mut control = TorControl::connect(&tor.control_addr).await?;
                control.authenticate(&tor).await?;
                Ok(control)
            },
        )
        .await
        .map_err(|e| match e {
            TransportError::Initialization(_) | TransportError::Timeout { .. } => e,
            other => TransportError::Initialization(other.to_string()),
        })?;

        *guard = Some(control);
        self.initialized.store(true, Ordering::Release);
        info!(control = %self.config.tor.control_addr, "tor transport initialized");
        Ok(())
    }

    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, TransportError> {
        self.ensure_initialized()?;
        if port == 0 {
            return Err(TransportError::Protocol(
                "hidden services need an explicit port".to_string(),
            ));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;
        let key_path = self.key_path(node_id);
        let control = Arc::clone(&self.control);

        let service_id = run_on_pool(
            &self.io_pool,
            self.config.init_timeout(),
            "tor hidden service",
            async move {
                let key_spec = read_key_file(&key_path)
                    .await
                    .unwrap_or_else(|| NEW_V3_KEY.to_string());

                let mut guard = control.lock().await;
                let control = guard.as_mut().ok_or(TransportError::NotInitialized)?;
                let onion = control.add_onion(&key_spec, port, local).await?;
                drop(guard);

                if let Some(key) = &onion.private_key {
                    write_key_file(&key_path, key).await?;
                }
                Ok(onion.service_id)
            },
        )
        .await?;

        let address = Address::new(format!("{}.onion", service_id), i32::from(port));
        self.servers
            .write()
            .insert(node_id.to_string(), address.clone());
        info!(node_id, %address, %local, "hidden service published");

        Ok(ServerSocketResult {
            node_id: node_id.to_string(),
            server_socket: ServerSocket::plain(listener),
            address,
        })
    }

    async fn get_connection(&self, address: &Address) -> Result<TcpStream, TransportError> {
        self.ensure_initialized()?;
        let port = address
            .tcp_port()
            .ok_or_else(|| TransportError::connection(address, "address has no tcp port"))?;

        let proxy = self.config.tor.socks_addr.clone();
        let host = address.host().to_string();
        let stream = run_on_pool(
            &self.io_pool,
            self.config.connect_timeout(),
            "tor connect",
            async move { socks::connect(&proxy, &host, port).await },
        )
        .await?;
        debug!(%address, "tor connection established");
        Ok(stream)
    }

    async fn shutdown(&self) {
        self.initialized.store(false, Ordering::Release);
        let previous = self.control.lock().await.take();
        self.servers.write().clear();
        if previous.is_some() {
            info!("tor transport shut down");
        } else {
            debug!("tor transport shut down before it was initialized");
        }
    }

    fn get_server_address(&self, server_id: &str) -> Option<Address> {
        self.servers.read().get(server_id).cloned()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}
