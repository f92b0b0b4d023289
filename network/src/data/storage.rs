//! # Data Storage
//!
//! Authoritative per-kind store of distributed data, keyed by [`DataId`].
//!
//! ## Bounds
//!
//! Three limits come from the kind's [`MetaData`]:
//!
//! - **size**: items whose payload exceeds `max_size_bytes` are rejected
//!   before they touch the map;
//! - **time**: an entry expires `ttl` after it was received. Expired
//!   entries are invisible to readers and are physically removed by the
//!   opportunistic sweep on every add or by [`DataStorage::sweep_expired`];
//! - **count**: after an insert pushes the population over
//!   `max_map_size`, entries are evicted soonest-to-expire first, ties
//!   broken by lower sequence number, then by id.
//!
//! ## Design
//!
//! - One `parking_lot::RwLock` guards the entry map and the expiry index
//!   together. Every mutation of a store is serialized through it, and
//!   eviction happens in the same critical section as the insert.
//! - The expiry index is a `BTreeSet` ordered by
//!   `(expire_at, sequence_number, id)`, so both the sweep and the eviction
//!   victim are at the front.
//! - Listeners are notified after the lock is released.
//!
//! [`StorageService`] owns one store per kind. Locally registered policy
//! wins over whatever MetaData a peer sends along with an item.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use super::authorization::AuthenticatedData;
use super::item::{DataId, DistributedDataItem};
use super::listener::ListenerRegistry;
use super::meta_data::{MetaData, MetaDataError};
use crate::clock::SharedClock;

// ---------------------------------------------------------------------------
// Outcomes & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: u32 },

    #[error("created_at {created_at} rejected at {now}: {reason}")]
    InvalidTimestamp {
        created_at: u64,
        now: u64,
        reason: &'static str,
    },

    #[error("item of kind {got} offered to store for {expected}")]
    KindMismatch { expected: String, got: String },

    #[error("invalid metadata: {0}")]
    InvalidMetaData(#[from] MetaDataError),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StorageEntry {
    pub data: AuthenticatedData,
    pub received_at_millis: u64,
    pub expire_at_millis: u64,
}

/// Expiry index key. Field order is the eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ExpiryKey {
    expire_at: u64,
    sequence_number: u64,
    id: DataId,
}

impl ExpiryKey {
    fn of(id: DataId, entry: &StorageEntry) -> Self {
        Self {
            expire_at: entry.expire_at_millis,
            sequence_number: entry.data.item.sequence_number(),
            id,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<DataId, StorageEntry>,
    expiry: BTreeSet<ExpiryKey>,
}

impl Inner {
    fn take(&mut self, key: &ExpiryKey) -> Option<StorageEntry> {
        self.expiry.remove(key);
        self.entries.remove(&key.id)
    }

    /// Removes everything with `expire_at <= now`.
    fn sweep(&mut self, now: u64) -> Vec<StorageEntry> {
        let mut expired = Vec::new();
        while let Some(key) = self.expiry.first().copied() {
            if key.expire_at > now {
                break;
            }
            if let Some(entry) = self.take(&key) {
                expired.push(entry);
            }
        }
        expired
    }

    fn num_expired(&self, now: u64) -> usize {
        self.expiry
            .iter()
            .take_while(|key| key.expire_at <= now)
            .count()
    }
}

// ---------------------------------------------------------------------------
// DataStorage
// ---------------------------------------------------------------------------

pub struct DataStorage {
    meta_data: MetaData,
    max_future_skew_ms: u64,
    clock: SharedClock,
    listeners: Arc<ListenerRegistry>,
    inner: RwLock<Inner>,
}

impl DataStorage {
    pub fn new(
        meta_data: MetaData,
        max_future_skew_ms: u64,
        clock: SharedClock,
        listeners: Arc<ListenerRegistry>,
    ) -> Result<Self, StorageError> {
        meta_data.validate()?;
        Ok(Self {
            meta_data,
            max_future_skew_ms,
            clock,
            listeners,
            inner: RwLock::new(Inner::default()),
        })
    }

    pub fn meta_data(&self) -> &MetaData {
        &self.meta_data
    }

    fn validate(&self, item: &DistributedDataItem, now: u64) -> Result<(), StorageError> {
        if item.class_name() != self.meta_data.class_name() {
            return Err(StorageError::KindMismatch {
                expected: self.meta_data.class_name().to_string(),
                got: item.class_name().to_string(),
            });
        }
        item.meta_data().validate()?;

        let max = self.meta_data.max_size_bytes();
        if item.payload_size() > max as usize {
            return Err(StorageError::PayloadTooLarge {
                size: item.payload_size(),
                max,
            });
        }

        let created_at = item.created_at_millis();
        if created_at > now.saturating_add(self.max_future_skew_ms) {
            return Err(StorageError::InvalidTimestamp {
                created_at,
                now,
                reason: "too far in the future",
            });
        }
        if created_at.saturating_add(self.meta_data.ttl_millis()) <= now {
            return Err(StorageError::InvalidTimestamp {
                created_at,
                now,
                reason: "already expired",
            });
        }
        Ok(())
    }

    /// Stores `data` unless it is already present.
    pub fn add(&self, data: AuthenticatedData) -> Result<AddOutcome, StorageError> {
        let now = self.clock.now_millis();
        self.validate(&data.item, now)?;

        let id = data.id();
        let max_map_size = self.meta_data.max_map_size();
        let added_item = data.item.clone();

        let (outcome, expired, evicted) = {
            let mut inner = self.inner.write();
            let expired = inner.sweep(now);

            if inner.entries.contains_key(&id) {
                (AddOutcome::AlreadyPresent, expired, Vec::new())
            } else {
                let entry = StorageEntry {
                    data,
                    received_at_millis: now,
                    expire_at_millis: now.saturating_add(self.meta_data.ttl_millis()),
                };
                inner.expiry.insert(ExpiryKey::of(id, &entry));
                inner.entries.insert(id, entry);

                let mut evicted = Vec::new();
                while inner.entries.len() > max_map_size {
                    let Some(victim) = inner.expiry.first().copied() else {
                        break;
                    };
                    if let Some(entry) = inner.take(&victim) {
                        evicted.push(entry);
                    }
                }
                (AddOutcome::Added, expired, evicted)
            }
        };

        for entry in &expired {
            self.listeners.notify_removed(&entry.data.item);
        }
        if outcome == AddOutcome::Added {
            debug!(kind = self.meta_data.class_name(), %id, "item stored");
            self.listeners.notify_added(&added_item);
        }
        for entry in &evicted {
            debug!(
                kind = self.meta_data.class_name(),
                id = %entry.data.id(),
                "item evicted at capacity"
            );
            self.listeners.notify_removed(&entry.data.item);
        }
        Ok(outcome)
    }

    pub fn remove(&self, id: &DataId) -> RemoveOutcome {
        let removed = {
            let mut inner = self.inner.write();
            let key = inner.entries.get(id).map(|entry| ExpiryKey::of(*id, entry));
            key.and_then(|key| inner.take(&key))
        };
        match removed {
            Some(entry) => {
                debug!(kind = self.meta_data.class_name(), %id, "item removed");
                self.listeners.notify_removed(&entry.data.item);
                RemoveOutcome::Removed
            }
            None => RemoveOutcome::NotFound,
        }
    }

    /// Removes every expired entry. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let expired = self.inner.write().sweep(now);
        for entry in &expired {
            self.listeners.notify_removed(&entry.data.item);
        }
        if !expired.is_empty() {
            debug!(kind = self.meta_data.class_name(), count = expired.len(), "expired items swept");
        }
        expired.len()
    }

    /// The live entry for `id`, if any.
    pub fn get_entry(&self, id: &DataId) -> Option<StorageEntry> {
        let now = self.clock.now_millis();
        self.inner
            .read()
            .entries
            .get(id)
            .filter(|entry| entry.expire_at_millis > now)
            .cloned()
    }

    pub fn get(&self, id: &DataId) -> Option<AuthenticatedData> {
        self.get_entry(id).map(|entry| entry.data)
    }

    pub fn contains(&self, id: &DataId) -> bool {
        self.get_entry(id).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let inner = self.inner.read();
        inner.entries.len() - inner.num_expired(now)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live items, soonest-to-expire first.
    pub fn items(&self) -> Vec<AuthenticatedData> {
        let now = self.clock.now_millis();
        let inner = self.inner.read();
        inner
            .expiry
            .iter()
            .filter(|key| key.expire_at > now)
            .filter_map(|key| inner.entries.get(&key.id))
            .map(|entry| entry.data.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// StorageService
// ---------------------------------------------------------------------------

/// One [`DataStorage`] per kind, created on demand.
pub struct StorageService {
    stores: DashMap<String, Arc<DataStorage>>,
    max_future_skew_ms: u64,
    clock: SharedClock,
    listeners: Arc<ListenerRegistry>,
}

impl StorageService {
    pub fn new(
        clock: SharedClock,
        max_future_skew_ms: u64,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            stores: DashMap::new(),
            max_future_skew_ms,
            clock,
            listeners,
        }
    }

    /// Registers local policy for a kind. An existing store keeps its policy.
    pub fn register_kind(&self, meta_data: MetaData) -> Result<Arc<DataStorage>, StorageError> {
        if let Some(existing) = self.stores.get(meta_data.class_name()) {
            return Ok(Arc::clone(existing.value()));
        }
        let class_name = meta_data.class_name().to_string();
        let store = Arc::new(DataStorage::new(
            meta_data,
            self.max_future_skew_ms,
            Arc::clone(&self.clock),
            Arc::clone(&self.listeners),
        )?);
        let store = Arc::clone(self.stores.entry(class_name.clone()).or_insert(store).value());
        info!(kind = %class_name, policy = %store.meta_data(), "data kind registered");
        Ok(store)
    }

    /// The store for `meta_data`'s kind, created from it if unknown.
    pub fn store_for(&self, meta_data: &MetaData) -> Result<Arc<DataStorage>, StorageError> {
        if let Some(store) = self.get_store(meta_data.class_name()) {
            return Ok(store);
        }
        self.register_kind(meta_data.clone())
    }

    pub fn get_store(&self, class_name: &str) -> Option<Arc<DataStorage>> {
        self.stores.get(class_name).map(|store| Arc::clone(store.value()))
    }

    pub fn kinds(&self) -> Vec<String> {
        self.stores.iter().map(|store| store.key().clone()).collect()
    }

    /// Live entries across all kinds.
    pub fn total_len(&self) -> usize {
        self.all_stores().iter().map(|store| store.len()).sum()
    }

    pub fn sweep_expired(&self) -> usize {
        self.all_stores()
            .iter()
            .map(|store| store.sweep_expired())
            .sum()
    }

    fn all_stores(&self) -> Vec<Arc<DataStorage>> {
        self.stores
            .iter()
            .map(|store| Arc::clone(store.value()))
            .collect()
    }
}
