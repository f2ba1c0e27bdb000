use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::kind::RequestKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendBackRaw {
    #[serde(default)]
    pub request: bool,
    #[serde(default)]
    pub response: bool,
}

/// A bitmask of allowed `RequestKind`s for a custom provider, plus optional
/// per-kind path overrides (§4.3, §9 "Provider union").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomProviderConfig {
    pub base_provider: String,
    pub allowed_requests: AllowedRequests,
    #[serde(default)]
    pub path_overrides: HashMap<String, String>,
}

/// One bit per `RequestKind` variant. Stored as a fixed bool array rather than
/// a literal bitmask integer so indices stay named and exhaustive — the same
/// shape the corpus's own `DispatchTable([DispatchRule; COUNT])` uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedRequests(Vec<bool>);

const KIND_COUNT: usize = 28;

impl Default for AllowedRequests {
    fn default() -> Self {
        Self(vec![true; KIND_COUNT])
    }
}

impl AllowedRequests {
    pub fn allow_only(kinds: &[RequestKind]) -> Self {
        let mut mask = vec![false; KIND_COUNT];
        for k in kinds {
            mask[kind_index(*k)] = true;
        }
        Self(mask)
    }

    pub fn is_allowed(&self, kind: RequestKind) -> bool {
        self.0.get(kind_index(kind)).copied().unwrap_or(false)
    }

    pub fn disallow(&mut self, kind: RequestKind) {
        if let Some(slot) = self.0.get_mut(kind_index(kind)) {
            *slot = false;
        }
    }
}

fn kind_index(kind: RequestKind) -> usize {
    use RequestKind::*;
    match kind {
        ChatCompletion => 0,
        ChatCompletionStream => 1,
        TextCompletion => 2,
        TextCompletionStream => 3,
        Responses => 4,
        ResponsesStream => 5,
        Embedding => 6,
        Speech => 7,
        SpeechStream => 8,
        Transcription => 9,
        TranscriptionStream => 10,
        ImageGeneration => 11,
        ImageGenerationStream => 12,
        ImageEdit => 13,
        ImageVariation => 14,
        CountTokens => 15,
        ListModels => 16,
        BatchCreate => 17,
        BatchList => 18,
        BatchRetrieve => 19,
        BatchCancel => 20,
        BatchResults => 21,
        FileUpload => 22,
        FileList => 23,
        FileRetrieve => 24,
        FileDelete => 25,
        FileContent => 26,
        McpToolExecute => 27,
    }
}

/// Per-provider settings (§3 `ProviderConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub network: NetworkConfig,
    pub concurrency: u32,
    pub buffer_size: u32,
    #[serde(default)]
    pub drop_excess_requests: bool,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub custom_provider: Option<CustomProviderConfig>,
    #[serde(default)]
    pub send_back_raw: SendBackRaw,
}

#[derive(Debug, Clone)]
pub enum ProviderConfigError {
    RetryBackoffOrdering,
    ZeroConcurrency,
}

impl ProviderConfig {
    /// Invariant (§3): `RetryBackoffInitialMs ≤ RetryBackoffMaxMs`; `Concurrency ≥ 1`.
    pub fn validate(&self) -> Result<(), ProviderConfigError> {
        if self.network.retry_backoff_initial_ms > self.network.retry_backoff_max_ms {
            return Err(ProviderConfigError::RetryBackoffOrdering);
        }
        if self.concurrency == 0 {
            return Err(ProviderConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(initial: u64, max: u64, concurrency: u32) -> ProviderConfig {
        ProviderConfig {
            network: NetworkConfig {
                base_url: None,
                headers: HashMap::new(),
                request_timeout_ms: 30_000,
                max_retries: 2,
                retry_backoff_initial_ms: initial,
                retry_backoff_max_ms: max,
            },
            concurrency,
            buffer_size: 16,
            drop_excess_requests: false,
            proxy: None,
            custom_provider: None,
            send_back_raw: SendBackRaw::default(),
        }
    }

    #[test]
    fn rejects_backoff_ordering_violation() {
        assert!(matches!(
            cfg(500, 100, 1).validate(),
            Err(ProviderConfigError::RetryBackoffOrdering)
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(matches!(
            cfg(100, 500, 0).validate(),
            Err(ProviderConfigError::ZeroConcurrency)
        ));
    }

    #[test]
    fn accepts_valid_config() {
        assert!(cfg(100, 500, 4).validate().is_ok());
    }

    #[test]
    fn allowed_requests_masks_disallowed_kinds() {
        let allowed = AllowedRequests::allow_only(&[RequestKind::ChatCompletion]);
        assert!(allowed.is_allowed(RequestKind::ChatCompletion));
        assert!(!allowed.is_allowed(RequestKind::Embedding));
    }
}
