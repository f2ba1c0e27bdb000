use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;

use ferrogate_common::{CoreError, CredentialId};
use ferrogate_protocol::{Key, RequestKind};

use crate::events::{Event, ModelUnavailableStartEvent, OperationalEvent, UnavailableStartEvent};
use crate::{EventHub, UnavailableReason};

use super::model_unavailable_queue::ModelUnavailableQueue;
use super::state::CredentialState;
use super::unavailable_queue::UnavailableQueue;

type ModelStateKey = (CredentialId, String);
type ModelStateValue = (Instant, UnavailableReason);

/// Stateless selection algorithm plus the per-key/per-(key,model) unavailability
/// bookkeeping it reads (§4.5).
pub struct KeySelector {
    keys: RwLock<HashMap<String, Vec<Key>>>,
    states: Arc<RwLock<HashMap<CredentialId, CredentialState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
    events: EventHub,
    queue: Arc<UnavailableQueue>,
    model_queue: Arc<ModelUnavailableQueue>,
}

impl KeySelector {
    pub fn new(events: EventHub) -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(UnavailableQueue::new());
        let model_queue = Arc::new(ModelUnavailableQueue::new());
        queue
            .clone()
            .spawn_recover_task(states.clone(), events.clone());
        model_queue
            .clone()
            .spawn_recover_task(model_states.clone(), events.clone());
        Self {
            keys: RwLock::new(HashMap::new()),
            states,
            model_states,
            events,
            queue,
            model_queue,
        }
    }

    /// Populates (or replaces) the key snapshot for one provider, as read once
    /// from the Account/Key Registry (C1) at provider init or signalled refresh.
    pub async fn load_provider_keys(&self, provider: &str, provider_keys: Vec<Key>) {
        let mut states = self.states.write().await;
        for key in &provider_keys {
            states.entry(key.id).or_insert(CredentialState::Active);
        }
        drop(states);
        self.keys
            .write()
            .await
            .insert(provider.to_string(), provider_keys);
    }

    /// §4.5 selection algorithm. `exclude` holds keys already failed earlier
    /// within this attempt's retry sequence.
    pub async fn pick(
        &self,
        provider: &str,
        model: &str,
        kind: RequestKind,
        exclude: &[CredentialId],
    ) -> Result<Key, CoreError> {
        let keys = {
            let guard = self.keys.read().await;
            guard
                .get(provider)
                .cloned()
                .ok_or_else(|| CoreError::no_key_available(provider))?
        };

        let states = self.states.read().await;
        let model_states = self.model_states.read().await;
        let now = Instant::now();

        let mut eligible: Vec<Key> = keys
            .into_iter()
            .filter(|k| k.is_selectable())
            .filter(|k| k.eligible_for_model(model))
            .filter(|k| !kind.is_batch() || k.use_for_batch_api)
            .filter(|k| !exclude.contains(&k.id))
            .filter(|k| matches!(states.get(&k.id), Some(CredentialState::Active)))
            .filter(|k| match model_states.get(&(k.id, model.to_string())) {
                Some((until, _)) => *until <= now,
                None => true,
            })
            .collect();
        drop(model_states);
        drop(states);

        if eligible.is_empty() {
            return Err(CoreError::no_key_available(provider));
        }

        // Lexicographic tie-break (§9): stable-sort by id before building the
        // weighted distribution so equal-weight ties resolve deterministically
        // regardless of registration order.
        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let total_weight: u64 = eligible.iter().map(|k| k.weight as u64).sum();
        let mut pick = rand::rng().random_range(0..total_weight);
        for key in eligible.into_iter() {
            let w = key.weight as u64;
            if pick < w {
                return Ok(key);
            }
            pick -= w;
        }
        unreachable!("weighted pick must land inside total_weight")
    }

    pub async fn mark_unavailable(
        &self,
        credential_id: CredentialId,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.states.write().await;
            guard.insert(
                credential_id,
                CredentialState::Unavailable {
                    until: until_instant,
                    reason,
                },
            );
        }
        self.queue.push(until_instant, credential_id).await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn mark_model_unavailable(
        &self,
        credential_id: CredentialId,
        model: impl Into<String>,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let model = model.into();
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.model_states.write().await;
            guard.insert((credential_id, model.clone()), (until_instant, reason));
        }
        self.model_queue
            .push(until_instant, credential_id, model.clone())
            .await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::ModelUnavailableStart(
                ModelUnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    model,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        self.states.read().await.get(&credential_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogate_protocol::KeyValue;

    fn key(id: CredentialId, weight: u32) -> Key {
        Key {
            id,
            name: format!("k{id}"),
            value: KeyValue::Plain("sk-x".into()),
            eligible_models: vec![],
            weight,
            enabled: true,
            use_for_batch_api: false,
        }
    }

    #[tokio::test]
    async fn pick_excludes_disabled_and_zero_weight_keys() {
        let selector = KeySelector::new(EventHub::new(16));
        let mut disabled = key(1, 5);
        disabled.enabled = false;
        let zero_weight = key(2, 0);
        let good = key(3, 1);
        selector
            .load_provider_keys("openai", vec![disabled, zero_weight, good.clone()])
            .await;

        let picked = selector
            .pick("openai", "gpt-4o-mini", RequestKind::ChatCompletion, &[])
            .await
            .unwrap();
        assert_eq!(picked.id, good.id);
    }

    #[tokio::test]
    async fn pick_respects_eligible_models() {
        let selector = KeySelector::new(EventHub::new(16));
        let mut restricted = key(1, 1);
        restricted.eligible_models = vec!["gpt-4o".into()];
        selector
            .load_provider_keys("openai", vec![restricted])
            .await;

        let err = selector
            .pick("openai", "gpt-4o-mini", RequestKind::ChatCompletion, &[])
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn pick_requires_batch_flag_for_batch_kinds() {
        let selector = KeySelector::new(EventHub::new(16));
        let not_batch = key(1, 1);
        selector.load_provider_keys("openai", vec![not_batch]).await;

        let err = selector
            .pick("openai", "gpt-4o-mini", RequestKind::BatchCreate, &[])
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn pick_excludes_keys_already_failed_this_attempt() {
        let selector = KeySelector::new(EventHub::new(16));
        let only = key(1, 1);
        selector
            .load_provider_keys("openai", vec![only.clone()])
            .await;

        let err = selector
            .pick(
                "openai",
                "gpt-4o-mini",
                RequestKind::ChatCompletion,
                &[only.id],
            )
            .await;
        assert!(err.is_err());
    }
}
