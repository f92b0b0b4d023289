//! # Data Plane
//!
//! Everything about the items themselves: their per-kind policy
//! ([`MetaData`]), identity and payload ([`DistributedDataItem`]), proof of
//! ownership ([`Authorization`]), bounded per-kind storage
//! ([`DataStorage`]) and the [`DataService`] façade that publishes,
//! receives and relays them.

pub mod authorization;
pub mod item;
pub mod listener;
pub mod meta_data;
pub mod pow;
pub mod service;
pub mod storage;

pub use authorization::{
    AuthError, AuthenticatedData, Authorization, AuthorizationService,
    DefaultAuthorizationService,
};
pub use item::{DataId, DistributedData, DistributedDataItem, ItemError};
pub use listener::{DataListener, ListenerId, ListenerRegistry};
pub use meta_data::{MetaData, MetaDataError};
pub use service::{DataService, DataServiceConfig, DataServiceError};
pub use storage::{AddOutcome, DataStorage, RemoveOutcome, StorageEntry, StorageError, StorageService};
