//! # Peer Group
//!
//! The set of live connections of one node, plus the connection targets
//! it tries to keep (min/max).
//!
//! Readers get snapshots: [`PeerGroup::all_connections`] clones the
//! current `Arc`s under a short read lock, so a broadcast iterates a
//! stable list while connections come and go underneath. Admission and
//! removal are crate-private; only the node runtime changes membership.
//!
//! A [`PeerConnection`] owns the write half of its socket behind an async
//! mutex, which keeps frames to one peer in FIFO order. The read half
//! belongs to the node's reader loop.
//!
//! ## Identity
//!
//! An outbound connection is known by the address we dialed. An inbound
//! one carries whatever address the peer put in its handshake. That
//! address is unchecked and only good for display. Duplicates among
//! inbound connections are detected on the remote endpoint the substrate
//! reported (TCP peer address, I2P destination), and
//! [`PeerGroup::find_by_address`] only ever returns outbound connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::config;
use crate::message::NetworkMessage;
use crate::transport::{Address, TransportType};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerGroupConfig {
    /// Below this a node wants more peers.
    pub min_connections: usize,
    /// Admission stops here.
    pub max_connections: usize,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            min_connections: config::DEFAULT_MIN_CONNECTIONS,
            max_connections: config::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerConnection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One live, handshaken connection to a peer.
pub struct PeerConnection {
    id: ConnectionId,
    peer_address: Address,
    peer_node_id: String,
    transport_type: TransportType,
    direction: Direction,
    /// Remote endpoint as reported by the substrate, for inbound sockets.
    remote: Option<String>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer_address", &self.peer_address)
            .field("peer_node_id", &self.peer_node_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    /// Splits `stream` and wraps the write half. The read half goes back
    /// to the caller for its reader loop.
    pub(crate) fn from_stream(
        stream: TcpStream,
        peer_address: Address,
        peer_node_id: String,
        transport_type: TransportType,
        direction: Direction,
        remote: Option<String>,
    ) -> (Arc<Self>, OwnedReadHalf) {
        let (reader, writer) = stream.into_split();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            peer_address,
            peer_node_id,
            transport_type,
            direction,
            remote,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        });
        (connection, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_address(&self) -> &Address {
        &self.peer_address
    }

    /// The address we dialed. `None` for inbound connections.
    pub fn dialed_address(&self) -> Option<&Address> {
        match self.direction {
            Direction::Outbound => Some(&self.peer_address),
            Direction::Inbound => None,
        }
    }

    /// Remote endpoint reported by the substrate for an inbound socket.
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    fn endpoint_key(&self) -> Option<String> {
        match self.direction {
            Direction::Outbound => Some(format!("dialed {}", self.peer_address)),
            Direction::Inbound => self.remote.as_ref().map(|r| format!("remote {}", r)),
        }
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes one frame to the peer. Frames from concurrent callers are
    /// serialized.
    pub async fn send(&self, message: &NetworkMessage) -> Result<(), ConnectionError> {
        let frame = codec::encode(message)?;
        self.send_frame(&frame).await
    }

    /// Writes an already encoded frame. Lets a broadcast encode once.
    pub(crate) async fn send_frame(&self, frame: &Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        writer.write_all(frame).await.map_err(CodecError::from)?;
        writer.flush().await.map_err(CodecError::from)?;
        trace!(connection = %self.id, bytes = frame.len(), "frame sent");
        Ok(())
    }

    /// Marks the connection closed and shuts the write side down. The
    /// peer sees EOF, and our reader loop ends once the peer closes too.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(connection = %self.id, peer = %self.peer_address, "connection closed");
    }
}

// ---------------------------------------------------------------------------
// PeerGroup
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerGroupError {
    #[error("peer group is full ({max} connections)")]
    Full { max: usize },

    #[error("already connected ({0})")]
    Duplicate(String),
}

pub struct PeerGroup {
    config: PeerGroupConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<PeerConnection>>>,
}

impl PeerGroup {
    pub fn new(config: PeerGroupConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PeerGroupConfig {
        &self.config
    }

    /// Point-in-time snapshot of every live connection.
    pub fn all_connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_below_target(&self) -> bool {
        self.num_connections() < self.config.min_connections
    }

    pub fn is_full(&self) -> bool {
        self.num_connections() >= self.config.max_connections
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<PeerConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// The outbound connection we dialed to `address`, if any.
    pub fn find_by_address(&self, address: &Address) -> Option<Arc<PeerConnection>> {
        self.connections
            .read()
            .values()
            .find(|c| c.dialed_address() == Some(address))
            .cloned()
    }

    pub(crate) fn add_connection(
        &self,
        connection: Arc<PeerConnection>,
    ) -> Result<(), PeerGroupError> {
        let mut connections = self.connections.write();
        if connections.len() >= self.config.max_connections {
            return Err(PeerGroupError::Full {
                max: self.config.max_connections,
            });
        }
        if let Some(key) = connection.endpoint_key() {
            if connections
                .values()
                .any(|c| c.endpoint_key().as_ref() == Some(&key))
            {
                return Err(PeerGroupError::Duplicate(key));
            }
        }

        debug!(
            connection = %connection.id(),
            peer = %connection.peer_address(),
            direction = ?connection.direction(),
            total = connections.len() + 1,
            "connection admitted"
        );
        connections.insert(connection.id(), connection);
        Ok(())
    }

    pub(crate) fn remove_connection(&self, id: &ConnectionId) -> Option<Arc<PeerConnection>> {
        let removed = self.connections.write().remove(id);
        if let Some(connection) = &removed {
            debug!(connection = %id, peer = %connection.peer_address(), "connection removed");
        }
        removed
    }

    /// Closes and drops every connection.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<PeerConnection>> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing peer connections");
        }
        for connection in drained {
            connection.close().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::net::TcpListener;

    /// A connected localhost socket pair: (dialer side, acceptor side).
    pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    /// A PeerConnection over a real socket, plus the far end's stream.
    pub(crate) async fn connection(
        peer_address: Address,
    ) -> (Arc<PeerConnection>, OwnedReadHalf, TcpStream) {
        let (near, far) = socket_pair().await;
        let (connection, reader) = PeerConnection::from_stream(
            near,
            peer_address,
            "peer".to_string(),
            TransportType::Clear,
            Direction::Outbound,
            None,
        );
        (connection, reader, far)
    }

    /// An inbound PeerConnection that claims `claimed` and was reported
    /// by the substrate as `remote`.
    pub(crate) async fn inbound_connection(
        claimed: Address,
        remote: &str,
    ) -> (Arc<PeerConnection>, OwnedReadHalf, TcpStream) {
        let (near, far) = socket_pair().await;
        let (connection, reader) = PeerConnection::from_stream(
            near,
            claimed,
            "peer".to_string(),
            TransportType::Clear,
            Direction::Inbound,
            Some(remote.to_string()),
        );
        (connection, reader, far)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{connection, inbound_connection};
    use super::*;
    use crate::config::PROTOCOL_VERSION;
    use crate::message::Handshake;

    fn group(max: usize) -> PeerGroup {
        PeerGroup::new(PeerGroupConfig {
            min_connections: 2,
            max_connections: max,
        })
    }

    // -- Membership ---------------------------------------------------------

    #[tokio::test]
    async fn admission_respects_max_connections() {
        let group = group(2);
        assert!(group.is_below_target());

        let (a, _ra, _fa) = connection(Address::localhost(1)).await;
        let (b, _rb, _fb) = connection(Address::localhost(2)).await;
        let (c, _rc, _fc) = connection(Address::localhost(3)).await;

        group.add_connection(a).unwrap();
        group.add_connection(b).unwrap();
        assert!(group.is_full());
        assert!(!group.is_below_target());
        assert_eq!(
            group.add_connection(c),
            Err(PeerGroupError::Full { max: 2 })
        );
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let group = group(4);
        let (a, _ra, _fa) = connection(Address::localhost(1)).await;
        let (dup, _rd, _fd) = connection(Address::localhost(1)).await;

        group.add_connection(a.clone()).unwrap();
        assert!(matches!(
            group.add_connection(dup),
            Err(PeerGroupError::Duplicate(_))
        ));
        assert_eq!(
            group.find_by_address(&Address::localhost(1)).map(|c| c.id()),
            Some(a.id())
        );
    }

    #[tokio::test]
    async fn claimed_address_does_not_shadow_a_dial() {
        let group = group(4);
        let (claimer, _rc, _fc) =
            inbound_connection(Address::localhost(1), "10.0.0.9:50000").await;
        let (dialed, _rd, _fd) = connection(Address::localhost(1)).await;

        group.add_connection(claimer.clone()).unwrap();
        assert!(group.find_by_address(&Address::localhost(1)).is_none());
        assert_eq!(claimer.dialed_address(), None);
        assert_eq!(claimer.remote(), Some("10.0.0.9:50000"));

        group.add_connection(dialed.clone()).unwrap();
        assert_eq!(
            group.find_by_address(&Address::localhost(1)).map(|c| c.id()),
            Some(dialed.id())
        );
    }

    #[tokio::test]
    async fn inbound_duplicates_are_keyed_by_remote_endpoint() {
        let group = group(4);
        let (first, _r1, _f1) = inbound_connection(Address::localhost(1), "dest-a").await;
        let (same_claim, _r2, _f2) = inbound_connection(Address::localhost(1), "dest-b").await;
        let (same_remote, _r3, _f3) = inbound_connection(Address::localhost(2), "dest-a").await;

        group.add_connection(first).unwrap();
        group.add_connection(same_claim).unwrap();
        assert_eq!(
            group.add_connection(same_remote),
            Err(PeerGroupError::Duplicate("remote dest-a".to_string()))
        );
        assert_eq!(group.num_connections(), 2);
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_removal() {
        let group = group(4);
        let (a, _ra, _fa) = connection(Address::localhost(1)).await;
        let (b, _rb, _fb) = connection(Address::localhost(2)).await;
        group.add_connection(a.clone()).unwrap();
        group.add_connection(b).unwrap();

        let snapshot = group.all_connections();
        group.remove_connection(&a.id());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(group.num_connections(), 1);
        assert!(group.get(&a.id()).is_none());
    }

    // -- Connection I/O -----------------------------------------------------

    #[tokio::test]
    async fn send_writes_a_frame() {
        let (conn, _reader, mut far) = connection(Address::localhost(1)).await;
        let message = NetworkMessage::Handshake(Handshake {
            node_id: "a".to_string(),
            address: None,
            protocol_version: PROTOCOL_VERSION,
        });
        conn.send(&message).await.unwrap();
        assert_eq!(codec::read_message(&mut far).await.unwrap(), message);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, _reader, _far) = connection(Address::localhost(1)).await;
        conn.close().await;
        assert!(conn.is_closed());
        let message = NetworkMessage::Handshake(Handshake {
            node_id: "a".to_string(),
            address: None,
            protocol_version: PROTOCOL_VERSION,
        });
        assert!(matches!(
            conn.send(&message).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let group = group(4);
        let (a, _ra, _fa) = connection(Address::localhost(1)).await;
        group.add_connection(a.clone()).unwrap();

        group.shutdown().await;
        assert_eq!(group.num_connections(), 0);
        assert!(a.is_closed());
    }
}
