//! Ordered registry of storage listeners.
//!
//! Dispatch runs under the registry's read lock and removal takes the
//! write lock, so once `remove` returns the listener will not be called
//! again. Listeners must not register or remove listeners from inside a
//! callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::item::DistributedDataItem;

/// Callback interface for storage mutations.
pub trait DataListener: Send + Sync {
    fn on_data_added(&self, item: &DistributedDataItem);

    /// Called on explicit removal, eviction and expiry alike.
    fn on_data_removed(&self, item: &DistributedDataItem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DataListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DataListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify_added(&self, item: &DistributedDataItem) {
        for (_, listener) in self.listeners.read().iter() {
            listener.on_data_added(item);
        }
    }

    pub(crate) fn notify_removed(&self, item: &DistributedDataItem) {
        for (_, listener) in self.listeners.read().iter() {
            listener.on_data_removed(item);
        }
    }
}
