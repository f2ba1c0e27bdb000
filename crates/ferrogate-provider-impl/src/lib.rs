//! Reference [`ProviderAdapter`](ferrogate_provider_core::ProviderAdapter)
//! implementations (C3) for the two wire-format families the rest of the
//! corpus's custom-provider story rides on: OpenAI-compatible chat
//! completions and the Anthropic Messages API. A `CustomProviderConfig`
//! pointed at a different `base_url` reuses one of these two unchanged.

pub mod anthropic;
pub mod client;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use client::shared_client;
pub use openai::OpenAiAdapter;
