//! # I2P Transport
//!
//! Runs on the SAM v3 bridge of a local I2P router.
//!
//! - **initialize**: a `HELLO` round trip proves the bridge is up and
//!   speaks SAM 3.1. Idempotent. Tunnel building happens later, per
//!   session.
//! - **get_server_socket**: one STREAM session per `(node_id, port)`. The
//!   session's private destination is persisted under
//!   `<base_dir>/i2p/<node_id>/destination.key`. Inbound streams are
//!   forwarded to a local listener with `STREAM FORWARD`. I2P has no
//!   ports, so the returned address carries [`Address::NO_PORT`].
//! - **get_connection**: `STREAM CONNECT` on a fresh bridge socket,
//!   through the node's server session or a lazily created client session.
//! - **shutdown**: drops every session socket, which makes the router tear
//!   the sessions down. The transport can be initialized again afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    read_key_file, run_on_pool, sam, write_key_file, Address, ServerSocket, ServerSocketResult,
    Transport, TransportConfig, TransportError, TransportType,
};
use crate::io_pool::IoPool;

/// A live SAM STREAM session. The router keeps the session for as long as
/// `control` stays open.
struct SamSession {
    id: String,
    /// Public (base64) destination.
    destination: String,
    _control: TcpStream,
    _forward: Option<TcpStream>,
}

#[derive(Default)]
struct I2pState {
    /// Server sessions by node id.
    servers: HashMap<String, SamSession>,
    /// Outbound-only session for nodes that never bound a server socket.
    client: Option<SamSession>,
}

pub struct I2pTransport {
    config: TransportConfig,
    io_pool: Arc<IoPool>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    state: Mutex<I2pState>,
    addresses: RwLock<HashMap<String, Address>>,
}

/// Creates a STREAM session and looks up its public destination.
/// Returns the session and its private destination key.
async fn create_session(
    sam_addr: &str,
    session_id: &str,
    private_key: Option<&str>,
    signature_type: u8,
) -> Result<(SamSession, String), TransportError> {
    let mut control = sam::hello(sam_addr).await?;

    let create = match private_key {
        Some(key) => format!(
            "SESSION CREATE STYLE=STREAM ID={} DESTINATION={}",
            session_id, key
        ),
        None => format!(
            "SESSION CREATE STYLE=STREAM ID={} DESTINATION=TRANSIENT SIGNATURE_TYPE={}",
            session_id, signature_type
        ),
    };
    let status = sam::command(&mut control, &create).await?;
    status.ensure_ok()?;
    let private = status
        .get("DESTINATION")
        .ok_or_else(|| TransportError::Protocol("SESSION STATUS without DESTINATION".to_string()))?
        .to_string();

    let lookup = sam::command(&mut control, "NAMING LOOKUP NAME=ME").await?;
    lookup.ensure_ok()?;
    let destination = lookup
        .get("VALUE")
        .ok_or_else(|| TransportError::Protocol("NAMING REPLY without VALUE".to_string()))?
        .to_string();

    Ok((
        SamSession {
            id: session_id.to_string(),
            destination,
            _control: control,
            _forward: None,
        },
        private,
    ))
}

impl I2pTransport {
    pub fn new(config: TransportConfig, io_pool: Arc<IoPool>) -> Self {
        Self {
            config,
            io_pool,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            state: Mutex::new(I2pState::default()),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    fn key_path(&self, node_id: &str) -> PathBuf {
        self.config
            .base_dir
            .join("i2p")
            .join(node_id)
            .join("destination.key")
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }

    /// The session outbound streams go through, creating a client session
    /// on first use.
    async fn outbound_session_id(&self) -> Result<String, TransportError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.servers.values().next() {
            return Ok(session.id.clone());
        }
        if let Some(client) = &state.client {
            return Ok(client.id.clone());
        }

        let session_id = format!("tessera-client-{}", uuid::Uuid::new_v4().simple());
        let sam_addr = self.config.i2p.sam_addr.clone();
        let signature_type = self.config.i2p.signature_type;
        let (session, _) = run_on_pool(
            &self.io_pool,
            self.config.init_timeout(),
            "i2p client session",
            async move { create_session(&sam_addr, &session_id, None, signature_type).await },
        )
        .await?;

        let id = session.id.clone();
        debug!(session = %id, "i2p client session created");
        state.client = Some(session);
        Ok(id)
    }
}

#[async_trait]
impl Transport for I2pTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::I2p
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let sam_addr = self.config.i2p.sam_addr.clone();
        run_on_pool(
            &self.io_pool,
            self.config.init_timeout(),
            "i2p initialization",
            async move { sam::hello(&sam_addr).await.map(drop) },
        )
        .await
        .map_err(|e| match e {
            TransportError::Timeout { .. } => e,
            other => TransportError::Initialization(other.to_string()),
        })?;

        self.initialized.store(true, Ordering::Release);
        info!(sam = %self.config.i2p.sam_addr, "i2p transport initialized");
        Ok(())
    }

    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, TransportError> {
        self.ensure_initialized()?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_port = listener.local_addr()?.port();
        let session_id = format!("{}-{}", node_id, port);
        let key_path = self.key_path(node_id);
        let sam_addr = self.config.i2p.sam_addr.clone();
        let signature_type = self.config.i2p.signature_type;

        let session = run_on_pool(
            &self.io_pool,
            self.config.init_timeout(),
            "i2p server session",
            async move {
                let stored = read_key_file(&key_path).await;
                let (mut session, private) =
                    create_session(&sam_addr, &session_id, stored.as_deref(), signature_type)
                        .await?;
                if stored.is_none() {
                    write_key_file(&key_path, &private).await?;
                }

                let mut forward = sam::hello(&sam_addr).await?;
                sam::command(
                    &mut forward,
                    &format!(
                        "STREAM FORWARD ID={} PORT={} SILENT=false",
                        session_id, local_port
                    ),
                )
                .await?
                .ensure_ok()?;
                session._forward = Some(forward);
                Ok(session)
            },
        )
        .await?;

        let address = Address::portless(session.destination.clone());
        info!(node_id, session = %session.id, local_port, "i2p server session ready");
        self.state
            .lock()
            .await
            .servers
            .insert(node_id.to_string(), session);
        self.addresses
            .write()
            .insert(node_id.to_string(), address.clone());

        Ok(ServerSocketResult {
            node_id: node_id.to_string(),
            server_socket: ServerSocket::sam_forwarded(listener),
            address,
        })
    }

    async fn get_connection(&self, address: &Address) -> Result<TcpStream, TransportError> {
        self.ensure_initialized()?;
        let session_id = self.outbound_session_id().await?;

        let sam_addr = self.config.i2p.sam_addr.clone();
        let destination = address.host().to_string();
        let target = address.clone();
        let stream = run_on_pool(
            &self.io_pool,
            self.config.connect_timeout(),
            "i2p connect",
            async move {
                let mut stream = sam::hello(&sam_addr).await?;
                sam::command(
                    &mut stream,
                    &format!(
                        "STREAM CONNECT ID={} DESTINATION={} SILENT=false",
                        session_id, destination
                    ),
                )
                .await?
                .ensure_ok()
                .map_err(|e| TransportError::connection(&target, e))?;
                Ok(stream)
            },
        )
        .await?;
        debug!(%address, "i2p connection established");
        Ok(stream)
    }

    async fn shutdown(&self) {
        let was_initialized = self.initialized.swap(false, Ordering::AcqRel);
        let mut state = self.state.lock().await;
        let sessions = state.servers.len() + usize::from(state.client.is_some());
        state.servers.clear();
        state.client = None;
        drop(state);
        self.addresses.write().clear();
        if was_initialized {
            info!(sessions, "i2p transport shut down");
        }
    }

    fn get_server_address(&self, server_id: &str) -> Option<Address> {
        self.addresses.read().get(server_id).cloned()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}
