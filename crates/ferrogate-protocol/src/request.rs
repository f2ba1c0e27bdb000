use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ferrogate_common::RequestId;

use crate::kind::{ProviderId, RequestKind};
use crate::message::{Input, Params};

/// An ordered `(provider, model)` alternative attempted on an earlier failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: ProviderId,
    pub model: String,
}

/// The dispatcher's unit of work (§3 `Req`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Req {
    pub request_id: RequestId,
    pub kind: RequestKind,
    pub provider: ProviderId,
    pub model: String,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
    pub input: Input,
    #[serde(default)]
    pub params: Params,
    /// Opaque per-tenant metadata: virtual key id, team id, customer id,
    /// selected routing rule id — carried, never interpreted by the core.
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl Req {
    /// `(provider, model)` attempts in dispatch order: primary then fallbacks.
    pub fn attempts(&self) -> Vec<(ProviderId, String)> {
        let mut out = vec![(self.provider.clone(), self.model.clone())];
        out.extend(
            self.fallbacks
                .iter()
                .map(|f| (f.provider.clone(), f.model.clone())),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_places_primary_first() {
        let req = Req {
            request_id: RequestId::generate(),
            kind: RequestKind::ChatCompletion,
            provider: ProviderId::OpenAI,
            model: "gpt-4o-mini".into(),
            fallbacks: vec![Fallback {
                provider: ProviderId::Anthropic,
                model: "claude-3-sonnet".into(),
            }],
            input: Input::Chat { messages: vec![] },
            params: Params::default(),
            metadata: HashMap::new(),
        };
        let attempts = req.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].0, ProviderId::OpenAI);
        assert_eq!(attempts[1].0, ProviderId::Anthropic);
    }
}
