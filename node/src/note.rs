//! The one data kind this binary publishes: a short text note.

use serde::{Deserialize, Serialize};

use tessera_network::data::meta_data::{MAX_MAP_SIZE_10_000, MAX_SIZE_10_000, TTL_10_DAYS};
use tessera_network::{DistributedData, MetaData};

pub const TEXT_NOTE_KIND: &str = "TextNote";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNote {
    pub text: String,
}

impl TextNote {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Local storage policy for notes.
    pub fn policy() -> MetaData {
        MetaData::new(TTL_10_DAYS, MAX_SIZE_10_000, TEXT_NOTE_KIND)
            .with_max_map_size(MAX_MAP_SIZE_10_000)
    }
}

impl DistributedData for TextNote {
    fn meta_data(&self) -> MetaData {
        Self::policy()
    }
}
