//! Wire messages exchanged between peers.

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, Signature};
use crate::data::{AuthenticatedData, DataId};
use crate::transport::Address;

/// First message on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: String,
    /// The sender's own server address, when it has one.
    pub address: Option<Address>,
    pub protocol_version: u16,
}

/// Flood request carrying a newly published item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDataRequest {
    pub data: AuthenticatedData,
}

/// Flood request removing an item, signed by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDataRequest {
    pub data_id: DataId,
    pub class_name: String,
    pub sequence_number: u64,
    pub owner: PublicKey,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    Handshake(Handshake),
    AddData(AddDataRequest),
    RemoveData(RemoveDataRequest),
}

impl NetworkMessage {
    /// Short name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::AddData(_) => "add_data",
            Self::RemoveData(_) => "remove_data",
        }
    }
}
