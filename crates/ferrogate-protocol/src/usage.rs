use serde::{Deserialize, Serialize};

/// Cross-provider usage counters. A `ProviderAdapter::DecodeResponse` maps
/// whatever the wire format calls these onto this single shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Later chunks win wholesale — providers emit a cumulative usage block,
    /// not a delta, on the chunk that carries it (§4.8 "taken from the last chunk").
    pub fn merge_latest(&mut self, other: Usage) {
        *self = other;
    }
}
