//! # Data Service
//!
//! The façade applications talk to. Publishing an item signs it, mints
//! its proof of work, stores it locally and floods it to the peer group.
//! Items arriving from peers go through the same storage path after their
//! authorization checks out, and are relayed onward to everyone except
//! the peer they came from.
//!
//! ## Flood termination
//!
//! Relaying only happens on [`AddOutcome::Added`] (or
//! [`RemoveOutcome::Removed`]), so a node forwards each item at most once
//! per storage lifetime and floods die out on cycles.
//!
//! ## Peer input
//!
//! Anything a peer sends that fails authorization or storage validation
//! is dropped and logged at debug. Nothing is sent back. Peers only ever
//! reach stores of kinds registered with [`DataService::register_kind`];
//! the TTL and size a peer puts on the wire never create a store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::authorization::{
    removal_digest, AuthError, AuthenticatedData, AuthorizationService,
    DefaultAuthorizationService,
};
use super::item::{DataId, DistributedData, DistributedDataItem, ItemError};
use super::listener::{DataListener, ListenerId, ListenerRegistry};
use super::meta_data::MetaData;
use super::storage::{AddOutcome, DataStorage, RemoveOutcome, StorageError, StorageService};
use crate::broadcast::{BroadcastResult, BroadcastService};
use crate::clock::SharedClock;
use crate::config;
use crate::crypto::KeyPair;
use crate::io_pool::IoPool;
use crate::message::{AddDataRequest, NetworkMessage, RemoveDataRequest};
use crate::node::MessageListener;
use crate::peer_group::{ConnectionId, PeerConnection, PeerGroup};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServiceConfig {
    /// Forward newly stored peer items to the rest of the peer group.
    pub relay: bool,
    /// Leading zero bits required of every item's proof of work.
    pub pow_difficulty: u8,
    /// How far in the future an item's creation time may lie.
    pub max_future_skew_ms: u64,
    pub expiry_sweep_interval_ms: u64,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            relay: true,
            pow_difficulty: config::DEFAULT_POW_DIFFICULTY,
            max_future_skew_ms: config::MAX_FUTURE_CLOCK_SKEW.as_millis() as u64,
            expiry_sweep_interval_ms: config::EXPIRY_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl DataServiceConfig {
    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_interval_ms)
    }
}

#[derive(Debug, Error)]
pub enum DataServiceError {
    #[error(transparent)]
    Item(#[from] ItemError),

    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("storage rejected item: {0}")]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// DataService
// ---------------------------------------------------------------------------

pub struct DataService {
    config: DataServiceConfig,
    storage: StorageService,
    listeners: Arc<ListenerRegistry>,
    broadcast: Arc<BroadcastService>,
    authorization: Arc<dyn AuthorizationService>,
    io_pool: Arc<IoPool>,
    clock: SharedClock,
    next_sequence: AtomicU64,
}

impl DataService {
    pub fn new(
        config: DataServiceConfig,
        broadcast: BroadcastService,
        io_pool: Arc<IoPool>,
        clock: SharedClock,
    ) -> Self {
        let authorization = Arc::new(DefaultAuthorizationService::new(config.pow_difficulty));
        Self::with_authorization(config, broadcast, io_pool, clock, authorization)
    }

    pub fn with_authorization(
        config: DataServiceConfig,
        broadcast: BroadcastService,
        io_pool: Arc<IoPool>,
        clock: SharedClock,
        authorization: Arc<dyn AuthorizationService>,
    ) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        let storage = StorageService::new(
            Arc::clone(&clock),
            config.max_future_skew_ms,
            Arc::clone(&listeners),
        );
        Self {
            config,
            storage,
            listeners,
            broadcast: Arc::new(broadcast),
            authorization,
            io_pool,
            clock,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DataServiceConfig {
        &self.config
    }

    /// The connections items are flooded to. Read-only.
    pub fn peer_group(&self) -> &Arc<PeerGroup> {
        self.broadcast.peer_group()
    }

    /// Registers local policy for a kind and opens it to peers. Peers'
    /// MetaData for the kind is ignored.
    pub fn register_kind(&self, meta_data: MetaData) -> Result<Arc<DataStorage>, StorageError> {
        self.storage.register_kind(meta_data)
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    pub fn add_listener(&self, listener: Arc<dyn DataListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn get(&self, class_name: &str, id: &DataId) -> Option<AuthenticatedData> {
        self.storage.get_store(class_name)?.get(id)
    }

    pub fn items_of_kind(&self, class_name: &str) -> Vec<AuthenticatedData> {
        self.storage
            .get_store(class_name)
            .map(|store| store.items())
            .unwrap_or_default()
    }

    // -- Publishing ----------------------------------------------------------

    /// Publishes `payload` as owned by `keypair`.
    ///
    /// Returns the broadcast outcome. An item that is already stored is
    /// neither re-stored nor re-broadcast, and yields an empty result.
    pub async fn add_network_payload<T: DistributedData>(
        &self,
        payload: &T,
        keypair: &KeyPair,
    ) -> Result<BroadcastResult, DataServiceError> {
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let item =
            DistributedDataItem::from_payload(payload, self.clock.now_millis(), sequence_number)?;
        let store = self.storage.store_for(item.meta_data())?;

        let id = item.id();
        if store.contains(&id) {
            debug!(kind = item.class_name(), %id, "item already stored, not re-publishing");
            return Ok(BroadcastResult::empty());
        }

        let authorization = self.authorization.authorize(&item, keypair).await?;
        let data = AuthenticatedData {
            item,
            authorization,
        };
        let message = NetworkMessage::AddData(AddDataRequest { data: data.clone() });

        match store.add(data)? {
            AddOutcome::Added => {
                let result = self.broadcast.broadcast(&message, None).await;
                info!(
                    kind = store.meta_data().class_name(),
                    %id,
                    success = result.num_success(),
                    failure = result.num_failure(),
                    "item published"
                );
                Ok(result)
            }
            AddOutcome::AlreadyPresent => Ok(BroadcastResult::empty()),
        }
    }

    /// Takes down an item previously published with `keypair`.
    ///
    /// Fails with [`AuthError::NotOwner`] when the stored item belongs to
    /// someone else. An item that is not stored yields an empty result.
    pub async fn remove_network_payload<T: DistributedData>(
        &self,
        payload: &T,
        keypair: &KeyPair,
    ) -> Result<BroadcastResult, DataServiceError> {
        let target = DistributedDataItem::from_payload(payload, 0, 0)?;
        let id = target.id();
        let Some(store) = self.storage.get_store(target.class_name()) else {
            return Ok(BroadcastResult::empty());
        };
        let Some(stored) = store.get(&id) else {
            debug!(kind = target.class_name(), %id, "nothing to remove");
            return Ok(BroadcastResult::empty());
        };
        if *stored.owner() != keypair.public_key() {
            return Err(AuthError::NotOwner.into());
        }

        let sequence_number = stored.item.sequence_number();
        let digest = removal_digest(&id, target.class_name(), sequence_number);
        let request = RemoveDataRequest {
            data_id: id,
            class_name: target.class_name().to_string(),
            sequence_number,
            owner: keypair.public_key(),
            signature: self.authorization.sign(&digest, keypair),
        };

        match store.remove(&id) {
            RemoveOutcome::Removed => {
                let result = self
                    .broadcast
                    .broadcast(&NetworkMessage::RemoveData(request), None)
                    .await;
                info!(
                    kind = target.class_name(),
                    %id,
                    success = result.num_success(),
                    failure = result.num_failure(),
                    "item removed"
                );
                Ok(result)
            }
            RemoveOutcome::NotFound => Ok(BroadcastResult::empty()),
        }
    }

    // -- Expiry --------------------------------------------------------------

    pub fn sweep_expired(&self) -> usize {
        self.storage.sweep_expired()
    }

    /// Sweeps expired items every `expiry_sweep_interval_ms` until
    /// `shutdown` flips.
    pub async fn run_expiry_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.expiry_sweep_interval();
        debug!(interval_ms = interval.as_millis() as u64, "expiry sweeper starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let swept = self.sweep_expired();
                    if swept > 0 {
                        debug!(swept, "expired items removed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("expiry sweeper stopped");
    }

    // -- Peer input ----------------------------------------------------------

    fn on_add_request(&self, from: &PeerConnection, request: AddDataRequest) {
        let data = request.data;
        let id = data.id();
        if let Err(e) = self.authorization.verify(&data) {
            debug!(peer = %from.peer_address(), %id, error = %e, "dropping unauthorized item");
            return;
        }
        let Some(store) = self.storage.get_store(data.item.class_name()) else {
            debug!(
                peer = %from.peer_address(),
                %id,
                kind = data.item.class_name(),
                "dropping item of unregistered kind"
            );
            return;
        };

        let message = NetworkMessage::AddData(AddDataRequest { data: data.clone() });
        match store.add(data) {
            Ok(AddOutcome::Added) => self.relay(message, from.id()),
            Ok(AddOutcome::AlreadyPresent) => {
                trace!(peer = %from.peer_address(), %id, "duplicate item");
            }
            Err(e) => {
                debug!(peer = %from.peer_address(), %id, error = %e, "dropping rejected item");
            }
        }
    }

    fn on_remove_request(&self, from: &PeerConnection, request: RemoveDataRequest) {
        let id = request.data_id;
        let Some(store) = self.storage.get_store(&request.class_name) else {
            trace!(peer = %from.peer_address(), %id, "removal for unknown kind");
            return;
        };
        let Some(stored) = store.get(&id) else {
            trace!(peer = %from.peer_address(), %id, "removal for unknown item");
            return;
        };
        if *stored.owner() != request.owner
            || stored.item.sequence_number() != request.sequence_number
        {
            debug!(peer = %from.peer_address(), %id, "removal does not match stored item");
            return;
        }
        let digest = removal_digest(&id, &request.class_name, request.sequence_number);
        if let Err(e) =
            self.authorization
                .verify_signature(&request.owner, &digest, &request.signature)
        {
            debug!(peer = %from.peer_address(), %id, error = %e, "dropping unauthorized removal");
            return;
        }

        if store.remove(&id) == RemoveOutcome::Removed {
            self.relay(NetworkMessage::RemoveData(request), from.id());
        }
    }

    /// Floods `message` to every peer except `from`, without waiting.
    fn relay(&self, message: NetworkMessage, from: ConnectionId) {
        if !self.config.relay {
            return;
        }
        let broadcast = Arc::clone(&self.broadcast);
        let spawned = self.io_pool.spawn_unbounded(async move {
            let result = broadcast.broadcast(&message, Some(from)).await;
            trace!(
                kind = message.kind(),
                success = result.num_success(),
                failure = result.num_failure(),
                "relay complete"
            );
        });
        if let Err(e) = spawned {
            debug!(error = %e, "relay not scheduled");
        }
    }
}

#[async_trait]
impl MessageListener for DataService {
    async fn on_message(&self, connection: &Arc<PeerConnection>, message: NetworkMessage) {
        match message {
            NetworkMessage::AddData(request) => self.on_add_request(connection, request),
            NetworkMessage::RemoveData(request) => self.on_remove_request(connection, request),
            NetworkMessage::Handshake(_) => {}
        }
    }
}
