pub mod config;
pub mod key;
pub mod kind;
pub mod message;
pub mod request;
pub mod response;
pub mod stream;
pub mod usage;

pub use config::{
    AllowedRequests, CustomProviderConfig, NetworkConfig, ProviderConfig, ProviderConfigError,
    ProxyConfig, SendBackRaw,
};
pub use key::{Key, KeyValue};
pub use kind::{ProviderId, RequestKind};
pub use message::{ChatMessage, Input, Params, ToolDefinition};
pub use request::{Fallback, Req};
pub use response::{ChatChoice, ChatResponse, ExtraFields, Resp, RespBody, ToolCall};
pub use stream::{AudioDelta, ChoiceDelta, ReasoningDetailDelta, StreamEvent, ToolCallDelta};
pub use usage::Usage;
