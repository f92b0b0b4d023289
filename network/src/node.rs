//! # Node Runtime
//!
//! Turns a [`Transport`] into handshaken [`PeerConnection`]s and feeds
//! the messages arriving on them to registered [`MessageListener`]s.
//!
//! ```text
//! initialize_server(port) ──> accept loop ──> inbound handshake ─┐
//! connect(address) ─────────> outbound handshake ────────────────┼─> PeerGroup
//!                                                                └─> reader loop ─> listeners
//! ```
//!
//! ## Handshake
//!
//! The dialer sends its [`Handshake`] first and waits for the answer. The
//! acceptor reads it, admits the connection to the peer group, and only
//! then answers, so by the time `connect` returns both sides already
//! count the connection. A protocol version mismatch or a full peer group
//! drops the socket without a reply.
//!
//! ## Reader loops
//!
//! One per connection, on the I/O pool without a permit, like the accept
//! loop and inbound handshakes (those end at the handshake timeout).
//! Frames are dispatched to the listeners in registration order, one at a
//! time, so a connection's messages are handled in the order they were
//! sent. EOF or a bad frame removes the connection from the group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, CodecError};
use crate::config;
use crate::io_pool::{IoPool, IoPoolError};
use crate::message::{Handshake, NetworkMessage};
use crate::peer_group::{ConnectionId, Direction, PeerConnection, PeerGroup, PeerGroupError};
use crate::transport::{
    AcceptedSocket, Address, PendingSocket, ServerSocket, Transport, TransportError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Deadline for the handshake exchange on a fresh socket.
    pub handshake_timeout_ms: u64,
    /// Deadline for writing one frame to a peer.
    pub send_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: config::HANDSHAKE_TIMEOUT.as_millis() as u64,
            send_timeout_ms: config::SEND_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Pool(#[from] IoPoolError),

    #[error(transparent)]
    PeerGroup(#[from] PeerGroupError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("expected handshake, got {0}")]
    UnexpectedMessage(&'static str),

    #[error("peer speaks protocol version {theirs}, we speak {ours}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("node is shut down")]
    ShutDown,
}

// ---------------------------------------------------------------------------
// MessageListener
// ---------------------------------------------------------------------------

/// Receives every non-handshake message arriving on any connection.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, connection: &Arc<PeerConnection>, message: NetworkMessage);
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    node_id: String,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    peer_group: Arc<PeerGroup>,
    io_pool: Arc<IoPool>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    server_address: RwLock<Option<Address>>,
    accept_task: Mutex<Option<AbortHandle>>,
    readers: DashMap<ConnectionId, AbortHandle>,
    shut_down: AtomicBool,
}

impl Node {
    pub fn new(
        node_id: impl Into<String>,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        peer_group: Arc<PeerGroup>,
        io_pool: Arc<IoPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            transport,
            peer_group,
            io_pool,
            listeners: RwLock::new(Vec::new()),
            server_address: RwLock::new(None),
            accept_task: Mutex::new(None),
            readers: DashMap::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_group(&self) -> &Arc<PeerGroup> {
        &self.peer_group
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn server_address(&self) -> Option<Address> {
        self.server_address.read().clone()
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().push(listener);
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(NodeError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn own_handshake(&self) -> NetworkMessage {
        NetworkMessage::Handshake(Handshake {
            node_id: self.node_id.clone(),
            address: self.server_address(),
            protocol_version: config::PROTOCOL_VERSION,
        })
    }

    // -- Server side ---------------------------------------------------------

    /// Initializes the transport, binds the server socket and starts
    /// accepting. Returns the address peers can reach us at.
    pub async fn initialize_server(self: &Arc<Self>, port: u16) -> Result<Address, NodeError> {
        self.ensure_running()?;
        self.transport.initialize().await?;
        let result = self
            .transport
            .get_server_socket(port, &self.node_id)
            .await?;
        let address = result.address;
        let server_socket = result.server_socket;
        *self.server_address.write() = Some(address.clone());

        let node = Arc::clone(self);
        let task = self
            .io_pool
            .spawn_unbounded(async move { node.accept_loop(server_socket).await })?;
        if let Some(previous) = self.accept_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }

        info!(
            node_id = %self.node_id,
            %address,
            transport = %self.transport.transport_type(),
            "node server listening"
        );
        Ok(address)
    }

    async fn accept_loop(self: Arc<Self>, server: ServerSocket) {
        loop {
            match server.accept().await {
                Ok(pending) => {
                    let node = Arc::clone(&self);
                    if let Err(e) = self
                        .io_pool
                        .spawn_unbounded(async move { node.handle_inbound(pending).await })
                    {
                        debug!(error = %e, "io pool closed, accept loop ends");
                        return;
                    }
                }
                Err(e) => {
                    if self.shut_down.load(Ordering::Acquire) {
                        return;
                    }
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, pending: PendingSocket) {
        let greeting = tokio::time::timeout(self.config.handshake_timeout(), async {
            let AcceptedSocket { mut stream, remote } = pending.resolve().await?;
            let handshake = read_handshake(&mut stream).await?;
            Ok::<_, NodeError>((stream, remote, handshake))
        })
        .await;
        let (stream, remote, handshake) = match greeting {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(e)) => {
                debug!(error = %e, "inbound handshake rejected");
                return;
            }
            Err(_) => {
                debug!("inbound handshake timed out");
                return;
            }
        };

        let peer_address = handshake
            .address
            .clone()
            .or_else(|| remote.as_deref().and_then(|r| r.parse().ok()))
            .unwrap_or_else(|| Address::portless("unknown"));

        let (connection, reader) = PeerConnection::from_stream(
            stream,
            peer_address,
            handshake.node_id,
            self.transport.transport_type(),
            Direction::Inbound,
            remote,
        );
        if let Err(e) = self.peer_group.add_connection(Arc::clone(&connection)) {
            debug!(peer = %connection.peer_address(), error = %e, "inbound connection refused");
            connection.close().await;
            return;
        }

        if let Err(e) = connection.send(&self.own_handshake()).await {
            debug!(peer = %connection.peer_address(), error = %e, "handshake reply failed");
            self.peer_group.remove_connection(&connection.id());
            connection.close().await;
            return;
        }

        if let Err(e) = self.spawn_reader(&connection, reader) {
            debug!(error = %e, "io pool closed, dropping inbound peer");
            self.peer_group.remove_connection(&connection.id());
            connection.close().await;
            return;
        }
        info!(
            peer = %connection.peer_address(),
            peer_node = connection.peer_node_id(),
            connections = self.peer_group.num_connections(),
            "inbound peer connected"
        );
    }

    // -- Client side ---------------------------------------------------------

    /// Connects to `address`, reusing a connection we dialed to it earlier.
    /// Inbound connections are never reused, whatever address they claim.
    pub async fn connect(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<Arc<PeerConnection>, NodeError> {
        self.ensure_running()?;
        if let Some(existing) = self.peer_group.find_by_address(address) {
            trace!(peer = %address, "reusing existing connection");
            return Ok(existing);
        }
        if self.peer_group.is_full() {
            return Err(PeerGroupError::Full {
                max: self.peer_group.config().max_connections,
            }
            .into());
        }

        let mut stream = self.transport.get_connection(address).await?;
        let own = self.own_handshake();
        let handshake = tokio::time::timeout(self.config.handshake_timeout(), async {
            codec::write_message(&mut stream, &own).await?;
            Ok::<_, NodeError>(read_handshake(&mut stream).await?)
        })
        .await
        .map_err(|_| NodeError::HandshakeTimeout)??;

        let (connection, reader) = PeerConnection::from_stream(
            stream,
            address.clone(),
            handshake.node_id,
            self.transport.transport_type(),
            Direction::Outbound,
            None,
        );
        if let Err(e) = self.peer_group.add_connection(Arc::clone(&connection)) {
            connection.close().await;
            return Err(e.into());
        }

        if let Err(e) = self.spawn_reader(&connection, reader) {
            self.peer_group.remove_connection(&connection.id());
            connection.close().await;
            return Err(e.into());
        }

        info!(
            peer = %address,
            peer_node = connection.peer_node_id(),
            connections = self.peer_group.num_connections(),
            "outbound peer connected"
        );
        Ok(connection)
    }

    // -- Reading -------------------------------------------------------------

    fn spawn_reader(
        self: &Arc<Self>,
        connection: &Arc<PeerConnection>,
        reader: OwnedReadHalf,
    ) -> Result<(), IoPoolError> {
        let node = Arc::clone(self);
        let reader_connection = Arc::clone(connection);
        let task = self
            .io_pool
            .spawn_unbounded(async move { node.read_loop(reader_connection, reader).await })?;
        self.readers.insert(connection.id(), task.abort_handle());
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, connection: Arc<PeerConnection>, reader: OwnedReadHalf) {
        let mut reader = BufReader::new(reader);
        loop {
            match codec::read_message(&mut reader).await {
                Ok(NetworkMessage::Handshake(_)) => {
                    debug!(peer = %connection.peer_address(), "ignoring repeated handshake");
                }
                Ok(message) => {
                    trace!(peer = %connection.peer_address(), kind = message.kind(), "message received");
                    let listeners = self.listeners.read().clone();
                    for listener in listeners {
                        listener.on_message(&connection, message.clone()).await;
                    }
                }
                Err(e) if e.is_eof() => {
                    debug!(peer = %connection.peer_address(), "peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %connection.peer_address(), error = %e, "dropping peer after bad frame");
                    break;
                }
            }
        }

        self.readers.remove(&connection.id());
        if self.peer_group.remove_connection(&connection.id()).is_some() {
            info!(
                peer = %connection.peer_address(),
                connections = self.peer_group.num_connections(),
                "peer disconnected"
            );
        }
        connection.close().await;
    }

    // -- Shutdown ------------------------------------------------------------

    /// Stops accepting, closes every connection and shuts the transport
    /// down. Idempotent, and safe on a node that never started.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(accept) = self.accept_task.lock().take() {
            accept.abort();
        }
        self.peer_group.shutdown().await;
        let readers: Vec<AbortHandle> = self
            .readers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.readers.clear();
        for reader in readers {
            reader.abort();
        }
        self.transport.shutdown().await;
        info!(node_id = %self.node_id, "node shut down");
    }
}

async fn read_handshake<S>(stream: &mut S) -> Result<Handshake, NodeError>
where
    S: AsyncRead + Unpin,
{
    match codec::read_message(stream).await? {
        NetworkMessage::Handshake(handshake) => {
            if handshake.protocol_version != config::PROTOCOL_VERSION {
                return Err(NodeError::VersionMismatch {
                    ours: config::PROTOCOL_VERSION,
                    theirs: handshake.protocol_version,
                });
            }
            Ok(handshake)
        }
        other => Err(NodeError::UnexpectedMessage(other.kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, Signature};
    use crate::data::DataId;
    use crate::message::RemoveDataRequest;
    use crate::peer_group::PeerGroupConfig;
    use crate::transport::{ClearTransport, TransportConfig};
    use tokio::net::TcpStream;

    fn node(id: &str) -> Arc<Node> {
        node_with_pool(id, 32)
    }

    fn node_with_pool(id: &str, pool_size: usize) -> Arc<Node> {
        let io_pool = Arc::new(IoPool::new(id, pool_size));
        let transport: Arc<dyn Transport> = Arc::new(ClearTransport::new(
            TransportConfig::default(),
            Arc::clone(&io_pool),
        ));
        Node::new(
            id,
            NodeConfig::default(),
            transport,
            Arc::new(PeerGroup::new(PeerGroupConfig::default())),
            io_pool,
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn remove_request() -> NetworkMessage {
        NetworkMessage::RemoveData(RemoveDataRequest {
            data_id: DataId::from_bytes([7; 32]),
            class_name: "Note".to_string(),
            sequence_number: 1,
            owner: KeyPair::generate().public_key(),
            signature: Signature::from_bytes(vec![0; 64]),
        })
    }

    struct Collect(Mutex<Vec<(String, NetworkMessage)>>);

    #[async_trait]
    impl MessageListener for Collect {
        async fn on_message(&self, connection: &Arc<PeerConnection>, message: NetworkMessage) {
            self.0
                .lock()
                .push((connection.peer_node_id().to_string(), message));
        }
    }

    // -- Handshake -----------------------------------------------------------

    #[tokio::test]
    async fn handshake_admits_both_sides() {
        let a = node("node-a");
        let b = node("node-b");
        let b_address = b.initialize_server(0).await.unwrap();
        a.transport().initialize().await.unwrap();

        let connection = a.connect(&b_address).await.unwrap();
        assert_eq!(connection.peer_node_id(), "node-b");
        assert_eq!(connection.direction(), Direction::Outbound);
        assert_eq!(a.peer_group().num_connections(), 1);
        assert_eq!(b.peer_group().num_connections(), 1);

        let inbound = b.peer_group().all_connections().remove(0);
        assert_eq!(inbound.peer_node_id(), "node-a");
        assert_eq!(inbound.direction(), Direction::Inbound);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn inbound_peer_shows_its_claimed_server_address() {
        let a = node("node-a");
        let b = node("node-b");
        let a_address = a.initialize_server(0).await.unwrap();
        let b_address = b.initialize_server(0).await.unwrap();

        a.connect(&b_address).await.unwrap();
        wait_for(|| b.peer_group().num_connections() == 1).await;
        let inbound = b.peer_group().all_connections().remove(0);
        assert_eq!(inbound.peer_address(), &a_address);
        assert!(inbound.remote().is_some());
        assert!(b.peer_group().find_by_address(&a_address).is_none());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn claimed_address_does_not_hijack_connect() {
        let a = node("node-a");
        let b = node("node-b");
        let a_address = a.initialize_server(0).await.unwrap();
        let b_address = b.initialize_server(0).await.unwrap();

        let mut impostor = TcpStream::connect(("127.0.0.1", b_address.tcp_port().unwrap()))
            .await
            .unwrap();
        let hello = NetworkMessage::Handshake(Handshake {
            node_id: "mallory".to_string(),
            address: Some(a_address.clone()),
            protocol_version: config::PROTOCOL_VERSION,
        });
        codec::write_message(&mut impostor, &hello).await.unwrap();
        codec::read_message(&mut impostor).await.unwrap();
        assert_eq!(b.peer_group().num_connections(), 1);

        let to_a = b.connect(&a_address).await.unwrap();
        assert_eq!(to_a.peer_node_id(), "node-a");
        assert_eq!(to_a.direction(), Direction::Outbound);
        assert_eq!(b.peer_group().num_connections(), 2);

        wait_for(|| a.peer_group().num_connections() == 1).await;
        a.connect(&b_address).await.unwrap();
        assert_eq!(a.peer_group().num_connections(), 2);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_peer_does_not_hold_up_other_inbound_peers() {
        let a = node("node-a");
        let b = node("node-b");
        let b_address = b.initialize_server(0).await.unwrap();
        a.transport().initialize().await.unwrap();

        let _silent = TcpStream::connect(("127.0.0.1", b_address.tcp_port().unwrap()))
            .await
            .unwrap();
        let connection = tokio::time::timeout(Duration::from_secs(2), a.connect(&b_address))
            .await
            .expect("inbound handshake blocked behind a silent socket")
            .unwrap();
        assert_eq!(connection.peer_node_id(), "node-b");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn connect_reuses_existing_connection() {
        let a = node("node-a");
        let b = node("node-b");
        let b_address = b.initialize_server(0).await.unwrap();
        a.transport().initialize().await.unwrap();

        let first = a.connect(&b_address).await.unwrap();
        let second = a.connect(&b_address).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(a.peer_group().num_connections(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn version_mismatch_is_dropped_without_reply() {
        let b = node("node-b");
        let b_address = b.initialize_server(0).await.unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", b_address.tcp_port().unwrap()))
            .await
            .unwrap();
        let hello = NetworkMessage::Handshake(Handshake {
            node_id: "stranger".to_string(),
            address: None,
            protocol_version: config::PROTOCOL_VERSION + 1,
        });
        codec::write_message(&mut raw, &hello).await.unwrap();

        let err = codec::read_message(&mut raw).await.unwrap_err();
        assert!(err.is_eof());
        assert_eq!(b.peer_group().num_connections(), 0);

        b.shutdown().await;
    }

    #[test]
    fn read_handshake_rejects_other_messages() {
        let frame = codec::encode(&remove_request()).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt
            .block_on(read_handshake(&mut frame.as_ref()))
            .unwrap_err();
        assert!(matches!(err, NodeError::UnexpectedMessage("remove_data")));
    }

    // -- Messages ------------------------------------------------------------

    #[tokio::test]
    async fn listeners_receive_peer_messages() {
        let a = node("node-a");
        let b = node("node-b");
        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        b.add_message_listener(collected.clone());
        let b_address = b.initialize_server(0).await.unwrap();
        a.transport().initialize().await.unwrap();

        let connection = a.connect(&b_address).await.unwrap();
        connection.send(&remove_request()).await.unwrap();

        wait_for(|| collected.0.lock().len() == 1).await;
        let (from, message) = collected.0.lock().remove(0);
        assert_eq!(from, "node-a");
        assert_eq!(message.kind(), "remove_data");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn single_permit_pool_serves_several_peers() {
        let hub = node_with_pool("hub", 1);
        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        hub.add_message_listener(collected.clone());
        let hub_address = hub.initialize_server(0).await.unwrap();

        let mut spokes = Vec::new();
        for i in 0..3 {
            let spoke = node(&format!("spoke-{i}"));
            spoke.transport().initialize().await.unwrap();
            let connection = spoke.connect(&hub_address).await.unwrap();
            connection.send(&remove_request()).await.unwrap();
            spokes.push(spoke);
        }

        wait_for(|| collected.0.lock().len() == 3).await;
        assert_eq!(hub.peer_group().num_connections(), 3);

        for spoke in spokes {
            spoke.shutdown().await;
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn closed_peer_leaves_the_group() {
        let a = node("node-a");
        let b = node("node-b");
        let b_address = b.initialize_server(0).await.unwrap();
        a.transport().initialize().await.unwrap();

        a.connect(&b_address).await.unwrap();
        wait_for(|| b.peer_group().num_connections() == 1).await;

        a.shutdown().await;
        wait_for(|| b.peer_group().num_connections() == 0).await;
        b.shutdown().await;
    }

    // -- Shutdown ------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_is_idempotent_and_safe_before_start() {
        let a = node("node-a");
        a.shutdown().await;
        a.shutdown().await;

        let err = a.connect(&Address::localhost(1)).await.unwrap_err();
        assert!(matches!(err, NodeError::ShutDown));
        assert!(matches!(
            a.initialize_server(0).await.unwrap_err(),
            NodeError::ShutDown
        ));
    }
}
