//! Distributed data items and their content-derived identity.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::meta_data::MetaData;

/// Anything that can be published to the network. The payload's kind and
/// policy come from its [`MetaData`].
pub trait DistributedData: Serialize {
    fn meta_data(&self) -> MetaData;
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// DataId
// ---------------------------------------------------------------------------

/// Content hash identifying an item: BLAKE3 over the bincode encoding of
/// `(class_name, payload)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId([u8; 32]);

impl DataId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn compute(class_name: &str, payload: &[u8]) -> Self {
        // Strings and byte vectors always encode.
        let encoded = bincode::serialize(&(class_name, payload)).unwrap_or_default();
        Self(*blake3::hash(&encoded).as_bytes())
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// DistributedDataItem
// ---------------------------------------------------------------------------

/// One published item: serialized payload plus the policy of its kind.
///
/// `created_at_millis` and `sequence_number` do not contribute to the
/// identity. Re-publishing the same payload yields the same [`DataId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedDataItem {
    payload: Vec<u8>,
    meta_data: MetaData,
    created_at_millis: u64,
    sequence_number: u64,
}

impl DistributedDataItem {
    pub fn new(
        payload: Vec<u8>,
        meta_data: MetaData,
        created_at_millis: u64,
        sequence_number: u64,
    ) -> Self {
        Self {
            payload,
            meta_data,
            created_at_millis,
            sequence_number,
        }
    }

    /// Serializes `data` with bincode and wraps it.
    pub fn from_payload<T: DistributedData>(
        data: &T,
        created_at_millis: u64,
        sequence_number: u64,
    ) -> Result<Self, ItemError> {
        let payload =
            bincode::serialize(data).map_err(|e| ItemError::Serialization(e.to_string()))?;
        Ok(Self::new(
            payload,
            data.meta_data(),
            created_at_millis,
            sequence_number,
        ))
    }

    pub fn id(&self) -> DataId {
        DataId::compute(self.meta_data.class_name(), &self.payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn meta_data(&self) -> &MetaData {
        &self.meta_data
    }

    pub fn class_name(&self) -> &str {
        self.meta_data.class_name()
    }

    pub fn created_at_millis(&self) -> u64 {
        self.created_at_millis
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Decodes the payload back into its application type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(&self.payload)
    }

    /// Digest the owner signs when publishing.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tessera/add/v1");
        hasher.update(self.id().as_bytes());
        hasher.update(&self.meta_data.ttl_millis().to_be_bytes());
        hasher.update(&self.meta_data.max_size_bytes().to_be_bytes());
        hasher.update(&self.created_at_millis.to_be_bytes());
        hasher.update(&self.sequence_number.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}
