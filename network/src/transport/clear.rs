//! Plain TCP transport. No substrate session, so `initialize` only flips
//! a flag; binding and dialing go straight to the OS.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::{
    run_on_pool, Address, ServerSocket, ServerSocketResult, Transport, TransportConfig,
    TransportError, TransportType,
};
use crate::io_pool::IoPool;

pub struct ClearTransport {
    config: TransportConfig,
    io_pool: Arc<IoPool>,
    initialized: AtomicBool,
    servers: RwLock<HashMap<String, Address>>,
}

impl ClearTransport {
    pub fn new(config: TransportConfig, io_pool: Arc<IoPool>) -> Self {
        Self {
            config,
            io_pool,
            initialized: AtomicBool::new(false),
            servers: RwLock::new(HashMap::new()),
        }
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
impl Transport for ClearTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!(bind_host = %self.config.bind_host, "clear transport initialized");
        }
        Ok(())
    }

    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, TransportError> {
        self.ensure_initialized()?;

        let host = self.config.bind_host.clone();
        let bind_host = host.clone();
        let listener = run_on_pool(
            &self.io_pool,
            self.config.connect_timeout(),
            "clear bind",
            async move { Ok(TcpListener::bind((bind_host.as_str(), port)).await?) },
        )
        .await?;

        let bound_port = listener.local_addr()?.port();
        let address = Address::new(host, i32::from(bound_port));
        self.servers
            .write()
            .insert(node_id.to_string(), address.clone());
        info!(node_id, %address, "clear server socket bound");

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

        let host = address.host().to_string();
        let target = address.clone();
        let stream = run_on_pool(
            &self.io_pool,
            self.config.connect_timeout(),
            "clear connect",
            async move {
                TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|e| TransportError::connection(&target, e))
            },
        )
        .await?;
        let _ = stream.set_nodelay(true);
        debug!(%address, "clear connection established");
        Ok(stream)
    }

    async fn shutdown(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.servers.write().clear();
            info!("clear transport shut down");
        }
    }

    fn get_server_address(&self, server_id: &str) -> Option<Address> {
        self.servers.read().get(server_id).cloned()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn transport() -> ClearTransport {
        ClearTransport::new(TransportConfig::default(), Arc::new(IoPool::new("test", 8)))
    }

    #[tokio::test]
    async fn bind_accept_and_connect() {
        let transport = transport();
        transport.initialize().await.unwrap();

        let result = transport.get_server_socket(0, "node-a").await.unwrap();
        assert_eq!(result.node_id, "node-a");
        assert!(result.address.port() > 0);
        assert_eq!(
            transport.get_server_address("node-a"),
            Some(result.address.clone())
        );

        let server = result.server_socket;
        let accept = tokio::spawn(async move {
            let mut accepted = server.accept().await.unwrap().resolve().await.unwrap();
            let mut buf = [0u8; 5];
            accepted.stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = transport.get_connection(&result.address).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unknown_server_id_has_no_address() {
        let transport = transport();
        transport.initialize().await.unwrap();
        assert_eq!(transport.get_server_address("nobody"), None);
    }

    #[tokio::test]
    async fn portless_address_is_rejected() {
        let transport = transport();
        transport.initialize().await.unwrap();
        let result = transport.get_connection(&Address::portless("somewhere")).await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
    }

    #[tokio::test]
    async fn calls_before_initialize_fail() {
        let transport = transport();
        assert!(matches!(
            transport.get_server_socket(0, "x").await,
            Err(TransportError::NotInitialized)
        ));
        assert!(matches!(
            transport.get_connection(&Address::localhost(1)).await,
            Err(TransportError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn shutdown_then_reinitialize() {
        let transport = transport();
        transport.shutdown().await;
        transport.initialize().await.unwrap();
        transport.get_server_socket(0, "a").await.unwrap();

        transport.shutdown().await;
        assert!(!transport.is_initialized());
        assert_eq!(transport.get_server_address("a"), None);

        transport.initialize().await.unwrap();
        assert!(transport.is_initialized());
    }
}
