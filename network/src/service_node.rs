//! # Service Node
//!
//! One complete node, wired from a [`NetworkConfig`]:
//!
//! ```text
//! transport ──> Node ──> PeerGroup <── BroadcastService <── DataService
//!                 └──────── MessageListener ─────────────────────┘
//! ```
//!
//! [`ServiceNode::start`] brings everything up under the configured
//! initialization deadline. If any step fails, whatever was already
//! running is shut down again before the error is returned.
//!
//! Local data kinds are registered before the server socket opens. Items
//! that peers send for any other kind are dropped, so the kinds passed to
//! [`ServiceNode::start_with_kinds`] are also the kinds this node stores
//! and relays for the network.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::BroadcastService;
use crate::clock::{system_clock, SharedClock};
use crate::config::{ConfigError, NetworkConfig};
use crate::data::{DataService, MetaData, StorageError};
use crate::io_pool::{IoPool, IoPoolError};
use crate::node::{Node, NodeError};
use crate::peer_group::{PeerConnection, PeerGroup};
use crate::transport::{create_transport, Address};

#[derive(Debug, Error)]
pub enum ServiceNodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid data kind: {0}")]
    Kind(#[from] StorageError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Pool(#[from] IoPoolError),

    #[error("node did not come up within {after_ms}ms")]
    InitDeadline { after_ms: u64 },
}

pub struct ServiceNode {
    config: NetworkConfig,
    node: Arc<Node>,
    data_service: Arc<DataService>,
    address: Address,
    stop_sweeper: watch::Sender<bool>,
}

impl ServiceNode {
    /// Starts a node that stores only what it publishes itself.
    pub async fn start(
        config: NetworkConfig,
        io_pool: Arc<IoPool>,
    ) -> Result<Self, ServiceNodeError> {
        Self::start_with_clock(config, io_pool, Vec::new(), system_clock()).await
    }

    /// Starts a node with local policy for `kinds` in place before any
    /// peer can connect.
    pub async fn start_with_kinds(
        config: NetworkConfig,
        io_pool: Arc<IoPool>,
        kinds: Vec<MetaData>,
    ) -> Result<Self, ServiceNodeError> {
        Self::start_with_clock(config, io_pool, kinds, system_clock()).await
    }

    /// Like [`start_with_kinds`](Self::start_with_kinds), with an explicit
    /// clock for storage.
    pub async fn start_with_clock(
        config: NetworkConfig,
        io_pool: Arc<IoPool>,
        kinds: Vec<MetaData>,
        clock: SharedClock,
    ) -> Result<Self, ServiceNodeError> {
        config.validate()?;
        let transport = create_transport(
            config.transport_type,
            config.transport.clone(),
            Arc::clone(&io_pool),
        );
        let peer_group = Arc::new(PeerGroup::new(config.peer_group.clone()));
        let node = Node::new(
            config.node_id.clone(),
            config.node.clone(),
            transport,
            Arc::clone(&peer_group),
            Arc::clone(&io_pool),
        );
        let broadcast =
            BroadcastService::new(peer_group, Arc::clone(&io_pool), config.node.send_timeout());
        let data_service = Arc::new(DataService::new(
            config.data.clone(),
            broadcast,
            Arc::clone(&io_pool),
            clock,
        ));
        for kind in kinds {
            data_service.register_kind(kind)?;
        }
        node.add_message_listener(data_service.clone());

        let deadline = config.init_deadline();
        let address = match tokio::time::timeout(deadline, node.initialize_server(config.port)).await
        {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => {
                warn!(node_id = %config.node_id, error = %e, "node failed to start");
                node.shutdown().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!(node_id = %config.node_id, "node start hit the init deadline");
                node.shutdown().await;
                return Err(ServiceNodeError::InitDeadline {
                    after_ms: config.init_deadline_ms,
                });
            }
        };

        let (stop_sweeper, stopped) = watch::channel(false);
        let sweeper = io_pool.spawn_unbounded({
            let data_service = Arc::clone(&data_service);
            async move { data_service.run_expiry_sweeper(stopped).await }
        });
        if let Err(e) = sweeper {
            node.shutdown().await;
            return Err(e.into());
        }

        info!(
            node_id = %config.node_id,
            %address,
            transport = %config.transport_type,
            "service node started"
        );
        Ok(Self {
            config,
            node,
            data_service,
            address,
            stop_sweeper,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The address peers reach this node at.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn data_service(&self) -> &Arc<DataService> {
        &self.data_service
    }

    pub fn peer_group(&self) -> &Arc<PeerGroup> {
        self.node.peer_group()
    }

    pub async fn connect_to(
        &self,
        address: &Address,
    ) -> Result<Arc<PeerConnection>, ServiceNodeError> {
        Ok(self.node.connect(address).await?)
    }

    /// Stops the expiry sweeper and shuts the node down. The I/O pool
    /// belongs to the caller and stays up.
    pub async fn shutdown(&self) {
        // Ignored: the sweeper may already be gone.
        let _ = self.stop_sweeper.send(true);
        self.node.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportType;
    use std::time::Duration;

    fn config(node_id: &str) -> NetworkConfig {
        NetworkConfig {
            node_id: node_id.to_string(),
            transport_type: TransportType::Clear,
            port: 0,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_and_connects_over_clear_tcp() {
        let io_pool = Arc::new(IoPool::new("test", 32));
        let a = ServiceNode::start(config("a"), Arc::clone(&io_pool)).await.unwrap();
        let b = ServiceNode::start(config("b"), Arc::clone(&io_pool)).await.unwrap();
        assert_eq!(a.address().host(), "127.0.0.1");
        assert!(a.address().tcp_port().is_some_and(|port| port != 0));

        a.connect_to(b.address()).await.unwrap();
        assert_eq!(a.peer_group().num_connections(), 1);

        a.shutdown().await;
        b.shutdown().await;
        io_pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn kinds_are_registered_before_accepting() {
        let io_pool = Arc::new(IoPool::new("test", 32));
        let policy = MetaData::new(60_000, 500, "Note").with_max_map_size(7);
        let node = ServiceNode::start_with_kinds(config("a"), Arc::clone(&io_pool), vec![policy])
            .await
            .unwrap();

        let store = node.data_service().storage().get_store("Note").unwrap();
        assert_eq!(store.meta_data().max_map_size(), 7);
        assert_eq!(store.meta_data().max_size_bytes(), 500);

        node.shutdown().await;
        io_pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn invalid_kind_or_pool_size_fails_before_binding() {
        let io_pool = Arc::new(IoPool::new("test", 8));
        let result = ServiceNode::start_with_kinds(
            config("a"),
            Arc::clone(&io_pool),
            vec![MetaData::new(0, 500, "Broken")],
        )
        .await;
        assert!(matches!(result, Err(ServiceNodeError::Kind(_))));

        let mut small = config("b");
        small.io_pool_size = 2;
        let result = ServiceNode::start(small, io_pool).await;
        assert!(matches!(
            result,
            Err(ServiceNodeError::Config(ConfigError::PoolTooSmall { .. }))
        ));
    }

    #[tokio::test]
    async fn unreachable_tor_fails_and_cleans_up() {
        let io_pool = Arc::new(IoPool::new("test", 8));
        let mut config = config("tor");
        config.transport_type = TransportType::Tor;
        config.port = 9840;
        // Nothing listens on port 1.
        config.transport.tor.control_addr = "127.0.0.1:1".to_string();

        let result = ServiceNode::start(config, io_pool).await;
        assert!(matches!(result, Err(ServiceNodeError::Node(_))));
    }

    #[tokio::test]
    async fn init_deadline_is_enforced() {
        let io_pool = Arc::new(IoPool::new("test", 8));
        // A control port that accepts but never answers.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config("slow");
        config.transport_type = TransportType::Tor;
        config.port = 9840;
        config.transport.tor.control_addr = silent.local_addr().unwrap().to_string();
        config.init_deadline_ms = 200;

        let result = ServiceNode::start(config, io_pool).await;
        assert!(matches!(
            result,
            Err(ServiceNodeError::InitDeadline { after_ms: 200 })
        ));
    }
}
