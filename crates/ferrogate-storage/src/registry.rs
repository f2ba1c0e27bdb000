//! Account / Key Registry (C1) backing stores: a sea-orm-backed
//! implementation for real deployments, and a static in-memory one for
//! demonstrations and tests that don't want a database in the loop.

use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use ferrogate_common::CoreError;
use ferrogate_protocol::{Key, KeyValue, ProviderConfig, ProviderId};
use ferrogate_provider_core::KeyRegistry;

use crate::entities::{credentials, providers};

fn parse_provider_id(name: &str) -> ProviderId {
    match name {
        "openai" => ProviderId::OpenAI,
        "anthropic" => ProviderId::Anthropic,
        "bedrock" => ProviderId::Bedrock,
        "vertex" => ProviderId::Vertex,
        "azure" => ProviderId::Azure,
        "cohere" => ProviderId::Cohere,
        "gemini" => ProviderId::Gemini,
        "ollama" => ProviderId::Ollama,
        "mistral" => ProviderId::Mistral,
        "groq" => ProviderId::Groq,
        other => ProviderId::Custom(other.to_string()),
    }
}

fn row_to_key(row: credentials::Model) -> Result<Key, CoreError> {
    let value: KeyValue = serde_json::from_value(row.secret_json)
        .map_err(|e| CoreError::internal(format!("malformed credential secret: {e}")))?;
    let eligible_models: Vec<String> = serde_json::from_value(row.eligible_models_json)
        .map_err(|e| CoreError::internal(format!("malformed eligible_models: {e}")))?;

    Ok(Key {
        id: row.id,
        name: row.name,
        value,
        eligible_models,
        weight: row.weight.max(0) as u32,
        enabled: row.enabled,
        use_for_batch_api: row.use_for_batch_api,
    })
}

/// Reads providers and their credentials straight out of the database on
/// every call — the core caches results itself (§C1 doc comment), so there
/// is no reason to duplicate that caching here.
pub struct SeaOrmKeyRegistry {
    db: DatabaseConnection,
}

impl SeaOrmKeyRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find_provider_row(&self, provider: &ProviderId) -> Result<providers::Model, CoreError> {
        providers::Entity::find()
            .filter(providers::Column::Name.eq(provider.as_str()))
            .one(&self.db)
            .await
            .map_err(|e| CoreError::internal(format!("provider lookup failed: {e}")))?
            .ok_or_else(|| CoreError::internal(format!("provider {provider} is not configured")))
    }
}

#[async_trait]
impl KeyRegistry for SeaOrmKeyRegistry {
    async fn configured_providers(&self) -> Result<Vec<ProviderId>, CoreError> {
        let rows = providers::Entity::find()
            .filter(providers::Column::Enabled.eq(true))
            .all(&self.db)
            .await
            .map_err(|e| CoreError::internal(format!("failed listing providers: {e}")))?;
        Ok(rows.into_iter().map(|r| parse_provider_id(&r.name)).collect())
    }

    async fn keys_for_provider(&self, provider: &ProviderId) -> Result<Vec<Key>, CoreError> {
        let provider_row = self.find_provider_row(provider).await?;
        let rows = credentials::Entity::find()
            .filter(credentials::Column::ProviderId.eq(provider_row.id))
            .all(&self.db)
            .await
            .map_err(|e| CoreError::internal(format!("failed listing credentials: {e}")))?;
        rows.into_iter().map(row_to_key).collect()
    }

    async fn config_for_provider(&self, provider: &ProviderId) -> Result<ProviderConfig, CoreError> {
        let row = self.find_provider_row(provider).await?;
        serde_json::from_value(row.config_json)
            .map_err(|e| CoreError::internal(format!("malformed provider config: {e}")))
    }
}

/// A fixed, in-process `KeyRegistry` — the `apps/ferrogate` demonstration
/// binary's default when no DSN is configured.
#[derive(Default)]
pub struct StaticKeyRegistry {
    entries: HashMap<String, (ProviderConfig, Vec<Key>)>,
}

impl StaticKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: ProviderId, config: ProviderConfig, keys: Vec<Key>) -> Self {
        self.entries.insert(provider.as_str().to_string(), (config, keys));
        self
    }
}

#[async_trait]
impl KeyRegistry for StaticKeyRegistry {
    async fn configured_providers(&self) -> Result<Vec<ProviderId>, CoreError> {
        Ok(self.entries.keys().map(|name| parse_provider_id(name)).collect())
    }

    async fn keys_for_provider(&self, provider: &ProviderId) -> Result<Vec<Key>, CoreError> {
        self.entries
            .get(provider.as_str())
            .map(|(_, keys)| keys.clone())
            .ok_or_else(|| CoreError::internal(format!("provider {provider} is not configured")))
    }

    async fn config_for_provider(&self, provider: &ProviderId) -> Result<ProviderConfig, CoreError> {
        self.entries
            .get(provider.as_str())
            .map(|(config, _)| config.clone())
            .ok_or_else(|| CoreError::internal(format!("provider {provider} is not configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogate_protocol::config::{NetworkConfig, SendBackRaw};
    use std::collections::HashMap as StdHashMap;

    fn config() -> ProviderConfig {
        ProviderConfig {
            network: NetworkConfig {
                base_url: None,
                headers: StdHashMap::new(),
                request_timeout_ms: 30_000,
                max_retries: 2,
                retry_backoff_initial_ms: 100,
                retry_backoff_max_ms: 1_000,
            },
            concurrency: 4,
            buffer_size: 16,
            drop_excess_requests: false,
            proxy: None,
            custom_provider: None,
            send_back_raw: SendBackRaw::default(),
        }
    }

    fn key() -> Key {
        Key {
            id: 1,
            name: "default".into(),
            value: KeyValue::Plain("sk-test".into()),
            eligible_models: vec![],
            weight: 1,
            enabled: true,
            use_for_batch_api: false,
        }
    }

    #[tokio::test]
    async fn static_registry_returns_configured_provider_and_keys() {
        let registry =
            StaticKeyRegistry::new().with_provider(ProviderId::OpenAI, config(), vec![key()]);

        let providers = registry.configured_providers().await.unwrap();
        assert_eq!(providers, vec![ProviderId::OpenAI]);

        let keys = registry.keys_for_provider(&ProviderId::OpenAI).await.unwrap();
        assert_eq!(keys.len(), 1);

        assert!(registry.keys_for_provider(&ProviderId::Anthropic).await.is_err());
    }
}
