//! Behaviour every transport backend must share, exercised against
//! in-process stand-ins for the Tor control port and the I2P SAM bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_network::transport::{create_transport, TransportConfig};
use tessera_network::{Address, IoPool, Transport, TransportError, TransportType};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// A line-oriented daemon stand-in. Answers every line with `reply(line)`
/// and counts the connections it accepted.
async fn fake_daemon(reply: fn(&str) -> String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if write.write_all(reply(&line).as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepted)
}

fn tor_reply(_line: &str) -> String {
    "250 OK\r\n".to_string()
}

fn sam_reply(line: &str) -> String {
    if line.starts_with("HELLO") {
        "HELLO REPLY RESULT=OK VERSION=3.1\n".to_string()
    } else {
        "STREAM STATUS RESULT=I2P_ERROR MESSAGE=\"not in this test\"\n".to_string()
    }
}

/// An address nothing listens on.
async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn transport(transport_type: TransportType, config: TransportConfig) -> Arc<dyn Transport> {
    create_transport(transport_type, config, Arc::new(IoPool::new("contract", 8)))
}

/// One transport of each kind, each pointed at a live stand-in, plus the
/// stand-ins' connection counters.
async fn live_transports() -> Vec<(Arc<dyn Transport>, Option<Arc<AtomicUsize>>)> {
    let (tor_addr, tor_accepted) = fake_daemon(tor_reply).await;
    let (sam_addr, sam_accepted) = fake_daemon(sam_reply).await;

    let mut tor = TransportConfig::default();
    tor.tor.control_addr = tor_addr;
    let mut i2p = TransportConfig::default();
    i2p.i2p.sam_addr = sam_addr;

    vec![
        (transport(TransportType::Clear, TransportConfig::default()), None),
        (transport(TransportType::Tor, tor), Some(tor_accepted)),
        (transport(TransportType::I2p, i2p), Some(sam_accepted)),
    ]
}

fn target_for(transport_type: TransportType) -> Address {
    match transport_type {
        TransportType::Clear => Address::localhost(1),
        TransportType::Tor => Address::new("abcdefghijklmnop.onion", 9999),
        TransportType::I2p => Address::portless("somebody~"),
    }
}

// -- Initialization ----------------------------------------------------------

#[tokio::test]
async fn double_initialize_is_a_single_initialize() {
    for (transport, accepted) in live_transports().await {
        let kind = transport.transport_type();
        transport.initialize().await.unwrap();
        let after_first = accepted.as_ref().map(|a| a.load(Ordering::SeqCst));
        transport.initialize().await.unwrap();
        let after_second = accepted.as_ref().map(|a| a.load(Ordering::SeqCst));

        assert!(transport.is_initialized(), "{kind} not initialized");
        assert_eq!(after_first, after_second, "{kind} initialized twice");
        transport.shutdown().await;
    }
}

#[tokio::test]
async fn unreachable_daemon_fails_initialization() {
    let mut tor = TransportConfig::default();
    tor.tor.control_addr = dead_address().await;
    let mut i2p = TransportConfig::default();
    i2p.i2p.sam_addr = dead_address().await;

    for transport in [
        transport(TransportType::Tor, tor),
        transport(TransportType::I2p, i2p),
    ] {
        let kind = transport.transport_type();
        let err = transport.initialize().await.unwrap_err();
        assert!(
            matches!(err, TransportError::Initialization(_)),
            "{kind}: unexpected {err:?}"
        );
        assert!(!transport.is_initialized());
    }
}

// -- Shutdown ----------------------------------------------------------------

#[tokio::test]
async fn connection_after_shutdown_fails_promptly() {
    for (transport, _) in live_transports().await {
        let kind = transport.transport_type();
        transport.initialize().await.unwrap();
        transport.shutdown().await;
        assert!(!transport.is_initialized());

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            transport.get_connection(&target_for(kind)),
        )
        .await
        .unwrap_or_else(|_| panic!("{kind} get_connection hung after shutdown"));
        assert!(
            matches!(result, Err(TransportError::NotInitialized)),
            "{kind}: unexpected {result:?}"
        );
    }
}

#[tokio::test]
async fn shutdown_without_initialize_is_harmless() {
    for (transport, _) in live_transports().await {
        transport.shutdown().await;
        transport.shutdown().await;
        assert!(!transport.is_initialized());
        assert!(matches!(
            transport.get_server_socket(9999, "node").await,
            Err(TransportError::NotInitialized)
        ));
    }
}

#[tokio::test]
async fn server_socket_before_initialize_is_refused() {
    for (transport, _) in live_transports().await {
        let err = transport.get_server_socket(9999, "node").await.unwrap_err();
        assert!(matches!(err, TransportError::NotInitialized));
        assert_eq!(transport.get_server_address("node"), None);
    }
}

// -- Connections -------------------------------------------------------------

#[tokio::test]
async fn unreachable_peer_is_a_connection_error() {
    let transport = transport(TransportType::Clear, TransportConfig::default());
    transport.initialize().await.unwrap();
    let dead: Address = dead_address().await.parse().unwrap();

    let err = transport.get_connection(&dead).await.unwrap_err();
    assert!(matches!(err, TransportError::Connection { .. }));
}

#[tokio::test]
async fn refused_i2p_session_is_a_protocol_error() {
    let (sam_addr, _) = fake_daemon(sam_reply).await;
    let mut config = TransportConfig::default();
    config.i2p.sam_addr = sam_addr;
    let transport = transport(TransportType::I2p, config);
    transport.initialize().await.unwrap();

    // The stand-in refuses SESSION CREATE, so no client session comes up.
    let err = transport
        .get_connection(&Address::portless("somebody~"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)), "unexpected {err:?}");
}
