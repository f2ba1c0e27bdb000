use serde::{Deserialize, Serialize};

/// The closed enumeration of operations the gateway dispatches (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ChatCompletion,
    ChatCompletionStream,
    TextCompletion,
    TextCompletionStream,
    Responses,
    ResponsesStream,
    Embedding,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
    ImageGeneration,
    ImageGenerationStream,
    ImageEdit,
    ImageVariation,
    CountTokens,
    ListModels,
    BatchCreate,
    BatchList,
    BatchRetrieve,
    BatchCancel,
    BatchResults,
    FileUpload,
    FileList,
    FileRetrieve,
    FileDelete,
    FileContent,
    McpToolExecute,
}

impl RequestKind {
    /// Streaming kinds return a `chan StreamEvent` from `ExecuteStream` rather
    /// than a single `Resp` from `Execute`.
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletionStream
                | RequestKind::TextCompletionStream
                | RequestKind::ResponsesStream
                | RequestKind::SpeechStream
                | RequestKind::TranscriptionStream
                | RequestKind::ImageGenerationStream
        )
    }

    /// §9: batch key eligibility is uniform across every batch kind, no
    /// per-provider exception table.
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            RequestKind::BatchCreate
                | RequestKind::BatchList
                | RequestKind::BatchRetrieve
                | RequestKind::BatchCancel
                | RequestKind::BatchResults
        )
    }

    /// Whether MCP tools may be merged into `Params.Tools` for this kind.
    pub fn supports_tools(self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletion
                | RequestKind::ChatCompletionStream
                | RequestKind::Responses
                | RequestKind::ResponsesStream
        )
    }
}

/// Known providers plus a branded custom-provider escape hatch (§9).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    OpenAI,
    Anthropic,
    Bedrock,
    Vertex,
    Azure,
    Cohere,
    Gemini,
    Ollama,
    Mistral,
    Groq,
    Custom(String),
}

impl ProviderId {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderId::OpenAI => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Bedrock => "bedrock",
            ProviderId::Vertex => "vertex",
            ProviderId::Azure => "azure",
            ProviderId::Cohere => "cohere",
            ProviderId::Gemini => "gemini",
            ProviderId::Ollama => "ollama",
            ProviderId::Mistral => "mistral",
            ProviderId::Groq => "groq",
            ProviderId::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_kinds_are_flagged() {
        assert!(RequestKind::ChatCompletionStream.is_streaming());
        assert!(!RequestKind::ChatCompletion.is_streaming());
    }

    #[test]
    fn batch_kinds_cover_all_five_variants() {
        assert!(RequestKind::BatchCreate.is_batch());
        assert!(RequestKind::BatchResults.is_batch());
        assert!(!RequestKind::FileUpload.is_batch());
    }

    #[test]
    fn custom_provider_round_trips_display() {
        let p = ProviderId::Custom("my-openai-compatible".into());
        assert_eq!(p.to_string(), "my-openai-compatible");
    }
}
