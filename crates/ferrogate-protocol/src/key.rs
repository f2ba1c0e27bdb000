use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ferrogate_common::CredentialId;

/// A credential usable against one provider (§3 `Key`).
///
/// `config_blob` carries provider-specific shape (Azure deployment map,
/// Vertex service account JSON, Bedrock STS role) opaque to the selector;
/// only the matching `ProviderAdapter` interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: CredentialId,
    pub name: String,
    pub value: KeyValue,
    #[serde(default)]
    pub eligible_models: Vec<String>,
    pub weight: u32,
    pub enabled: bool,
    #[serde(default)]
    pub use_for_batch_api: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Plain(String),
    ConfigBlob(JsonValue),
}

impl Key {
    /// Invariant (§3): zero-weight keys are ineligible regardless of `enabled`.
    pub fn is_selectable(&self) -> bool {
        self.enabled && self.weight > 0
    }

    pub fn eligible_for_model(&self, model: &str) -> bool {
        self.eligible_models.is_empty() || self.eligible_models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(weight: u32, enabled: bool) -> Key {
        Key {
            id: 1,
            name: "k".into(),
            value: KeyValue::Plain("sk-x".into()),
            eligible_models: vec![],
            weight,
            enabled,
            use_for_batch_api: false,
        }
    }

    #[test]
    fn zero_weight_key_is_not_selectable_even_if_enabled() {
        assert!(!key(0, true).is_selectable());
    }

    #[test]
    fn disabled_key_is_not_selectable() {
        assert!(!key(5, false).is_selectable());
    }

    #[test]
    fn empty_eligible_models_means_any_model() {
        let k = key(1, true);
        assert!(k.eligible_for_model("anything"));
    }
}
