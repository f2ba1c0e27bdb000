use serde::{Deserialize, Serialize};

use crate::usage::Usage;

/// A single decoded chunk off the wire (§4.3 `DecodeStreamChunk`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Delta(ChoiceDelta),
    Final(ChoiceDelta),
    Heartbeat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoiceDelta {
    pub index: u32,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub refusal: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_details: Vec<ReasoningDetailDelta>,
    #[serde(default)]
    pub audio: Option<AudioDelta>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningDetailDelta {
    pub index: u32,
    #[serde(default)]
    pub detail_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioDelta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}
