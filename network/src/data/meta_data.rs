//! # MetaData
//!
//! Static policy for one kind of distributed data: how long an item
//! lives, how large its serialized payload may be, and how many live
//! items of the kind a node keeps.
//!
//! Only `ttl`, `max_size_in_bytes` and `class_name` go on the wire.
//! `max_map_size` is local policy: a peer cannot make us store more than
//! we want to, so it is not transmitted and comes back as
//! [`MAX_MAP_SIZE_1000`] after decoding. Equality and hashing follow the
//! wire: two descriptors that differ only in `max_map_size` are equal.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

pub const TTL_2_DAYS: u64 = 2 * DAY_MILLIS;
pub const TTL_10_DAYS: u64 = 10 * DAY_MILLIS;
pub const TTL_15_DAYS: u64 = 15 * DAY_MILLIS;
pub const TTL_30_DAYS: u64 = 30 * DAY_MILLIS;
pub const TTL_100_DAYS: u64 = 100 * DAY_MILLIS;

pub const MAX_SIZE_1000: u32 = 1_000;
pub const MAX_SIZE_10_000: u32 = 10_000;

pub const MAX_MAP_SIZE_100: usize = 100;
pub const MAX_MAP_SIZE_1000: usize = 1_000;
pub const MAX_MAP_SIZE_10_000: usize = 10_000;

/// Reasons a descriptor is unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetaDataError {
    #[error("ttl must be positive")]
    ZeroTtl,

    #[error("max size must be positive")]
    ZeroMaxSize,

    #[error("max map size must be positive")]
    ZeroMaxMapSize,

    #[error("class name must not be empty")]
    EmptyClassName,
}

/// Policy descriptor for one data kind. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MetaDataWire", into = "MetaDataWire")]
pub struct MetaData {
    ttl_millis: u64,
    max_size_bytes: u32,
    class_name: String,
    max_map_size: usize,
}

#[derive(Serialize, Deserialize)]
struct MetaDataWire {
    ttl: u64,
    max_size_in_bytes: u32,
    class_name: String,
}

impl From<MetaDataWire> for MetaData {
    fn from(wire: MetaDataWire) -> Self {
        Self::new(wire.ttl, wire.max_size_in_bytes, wire.class_name)
    }
}

impl From<MetaData> for MetaDataWire {
    fn from(meta: MetaData) -> Self {
        Self {
            ttl: meta.ttl_millis,
            max_size_in_bytes: meta.max_size_bytes,
            class_name: meta.class_name,
        }
    }
}

impl MetaData {
    /// A descriptor with the default map size of 1000.
    pub fn new(ttl_millis: u64, max_size_bytes: u32, class_name: impl Into<String>) -> Self {
        Self {
            ttl_millis,
            max_size_bytes,
            class_name: class_name.into(),
            max_map_size: MAX_MAP_SIZE_1000,
        }
    }

    /// Ten days, 10 000 bytes, 1000 entries.
    pub fn for_class(class_name: impl Into<String>) -> Self {
        Self::new(TTL_10_DAYS, MAX_SIZE_10_000, class_name)
    }

    pub fn with_max_map_size(mut self, max_map_size: usize) -> Self {
        self.max_map_size = max_map_size;
        self
    }

    pub fn ttl_millis(&self) -> u64 {
        self.ttl_millis
    }

    pub fn max_size_bytes(&self) -> u32 {
        self.max_size_bytes
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn max_map_size(&self) -> usize {
        self.max_map_size
    }

    pub fn validate(&self) -> Result<(), MetaDataError> {
        if self.ttl_millis == 0 {
            return Err(MetaDataError::ZeroTtl);
        }
        if self.max_size_bytes == 0 {
            return Err(MetaDataError::ZeroMaxSize);
        }
        if self.max_map_size == 0 {
            return Err(MetaDataError::ZeroMaxMapSize);
        }
        if self.class_name.is_empty() {
            return Err(MetaDataError::EmptyClassName);
        }
        Ok(())
    }
}

impl PartialEq for MetaData {
    fn eq(&self, other: &Self) -> bool {
        self.ttl_millis == other.ttl_millis
            && self.max_size_bytes == other.max_size_bytes
            && self.class_name == other.class_name
    }
}

impl Eq for MetaData {}

impl Hash for MetaData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ttl_millis.hash(state);
        self.max_size_bytes.hash(state);
        self.class_name.hash(state);
    }
}

impl fmt::Display for MetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetaData{{class={}, ttl={}ms, max_size={}B, max_map_size={}}}",
            self.class_name, self.ttl_millis, self.max_size_bytes, self.max_map_size
        )
    }
}
