use async_trait::async_trait;

use ferrogate_common::CoreError;
use ferrogate_protocol::{Key, ProviderConfig, ProviderId};

/// Account / Key Registry (C1). The core caches results per provider for the
/// process lifetime; it never writes back. Errors are fatal for that provider
/// only.
///
/// The concrete backing store (database, file, env) is an out-of-scope
/// persistence concern — only this trait crosses into the core.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn configured_providers(&self) -> Result<Vec<ProviderId>, CoreError>;
    async fn keys_for_provider(&self, provider: &ProviderId) -> Result<Vec<Key>, CoreError>;
    async fn config_for_provider(&self, provider: &ProviderId) -> Result<ProviderConfig, CoreError>;
}
