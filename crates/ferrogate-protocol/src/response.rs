use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ferrogate_common::CredentialId;

use crate::kind::ProviderId;
use crate::usage::Usage;

/// Fields the core itself populates on every successful response (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraFields {
    pub provider: Option<String>,
    pub latency_ms: u64,
    pub key_id: Option<CredentialId>,
    pub retry_count: u32,
    pub fallback_index: u32,
}

/// The discriminated response envelope (§3 `Resp`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resp {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub body: RespBody,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub service_tier: Option<String>,
    #[serde(default)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RespBody {
    Chat(ChatResponse),
    TextCompletion { text: String },
    Embedding { vectors: Vec<Vec<f32>> },
    Speech { audio_base64: String },
    Transcription { text: String },
    Image { urls: Vec<String> },
    Responses { items: JsonValue },
    BatchOp { status: String, raw: JsonValue },
    FileOp { raw: JsonValue },
    ModelList { models: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub refusal: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}
