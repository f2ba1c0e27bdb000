use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use ferrogate_common::CoreError;
use ferrogate_protocol::{Key, Req, RequestKind, Resp, StreamEvent};

/// Maps provider errors onto the core taxonomy (§7), mirroring the corpus's
/// `Classify(httpStatus, providerErrorBody)` contract.
#[derive(Debug, Clone)]
pub struct Classification {
    pub retryable: bool,
    pub kind: ferrogate_common::ErrorKind,
    pub message: String,
}

/// A provider's capability object (C3). The core never speaks a provider's
/// wire format directly; adapters own that translation entirely.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: RequestKind) -> bool;

    /// Optional per-kind path override for custom providers (§4.3).
    fn path_override(&self, _kind: RequestKind) -> Option<String> {
        None
    }

    async fn encode_request(&self, req: &Req, key: &Key) -> Result<Vec<u8>, CoreError>;

    async fn decode_response(&self, wire: &[u8]) -> Result<Resp, CoreError>;

    async fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<StreamEvent, CoreError>;

    fn classify(&self, http_status: u16, provider_error_body: &[u8]) -> Classification;

    /// Executes one attempt end-to-end against the real transport. Adapters
    /// without live transport configured (tests, demonstration adapters) may
    /// implement this purely in terms of encode/decode over a stub transport.
    async fn call(&self, req: &Req, key: &Key) -> Result<Resp, CoreError>;

    /// Streaming counterpart of [`ProviderAdapter::call`]: opens the
    /// transport and forwards each decoded [`StreamEvent`] as it arrives, in
    /// wire order, terminating the channel once the provider closes the
    /// stream. An `Err` item means the transport itself failed mid-stream
    /// (§4.8); the receiver end is responsible for finalizing whatever the
    /// accumulator saw so far.
    async fn call_stream(
        &self,
        req: &Req,
        key: &Key,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError>;
}

/// Provider Adapter Registry (C3): `ProviderId -> Arc<dyn ProviderAdapter>`.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .await
            .insert(adapter.name().to_string(), adapter);
    }

    pub async fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.read().await.get(provider).cloned()
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        self.adapters.read().await.keys().cloned().collect()
    }
}
