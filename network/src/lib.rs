// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Network — Data Plane Library
//!
//! Tessera stores self-authenticating data items under size and time
//! bounds and floods them to every reachable peer. Peers can be reached
//! over clear TCP, Tor hidden services or I2P SAM sessions, and nothing
//! above the transport layer knows (or cares) which one is in use.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **config** — Protocol constants and the aggregated node configuration.
//! - **clock** — Injectable wall clock. Tests need to time travel.
//! - **crypto** — Ed25519 keys and signatures for data ownership.
//! - **io_pool** — The shared network I/O worker pool.
//! - **transport** — One contract, three substrates: Clear, Tor, I2P.
//! - **codec** / **message** — Framing and the wire vocabulary.
//! - **peer_group** — The live set of connections a node maintains.
//! - **node** — Accept loop, dialing, handshakes, reader loops.
//! - **broadcast** — Flood a message to the peer group, count the damage.
//! - **data** — MetaData, items, authorization, per-kind storage and the
//!   `DataService` façade that ties it all together.
//! - **service_node** — Wiring for one complete node.
//!
//! ## Design Philosophy
//!
//! 1. Best-effort epidemic dissemination, authoritative local storage.
//! 2. Partial failure is a return value, not an exception.
//! 3. Every substrate handshake runs on the I/O pool, never on the caller.
//! 4. Shutdown is always safe, even if initialization never finished.

pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod data;
pub mod io_pool;
pub mod message;
pub mod node;
pub mod peer_group;
pub mod service_node;
pub mod transport;

pub use broadcast::{BroadcastFailure, BroadcastResult, BroadcastService};
pub use config::NetworkConfig;
pub use data::{
    AddOutcome, DataId, DataListener, DataService, DataServiceConfig, DataStorage,
    DistributedData, DistributedDataItem, MetaData, RemoveOutcome,
};
pub use io_pool::IoPool;
pub use peer_group::{ConnectionId, PeerConnection, PeerGroup, PeerGroupConfig};
pub use service_node::{ServiceNode, ServiceNodeError};
pub use transport::{Address, Transport, TransportError, TransportType};
