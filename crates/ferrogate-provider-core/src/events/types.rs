use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use ferrogate_common::CredentialId;

use super::super::credential::UnavailableReason;

/// Ambient operational observability. Downstream/upstream HTTP traffic
/// recording is outside the core's scope (§1) — these events cover only the
/// unavailability lifecycle the Key Selector (C5) itself drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Operational(OperationalEvent),
    Dispatch(DispatchEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    UnavailableStart(UnavailableStartEvent),
    UnavailableEnd(UnavailableEndEvent),
    ModelUnavailableStart(ModelUnavailableStartEvent),
    ModelUnavailableEnd(ModelUnavailableEndEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUnavailableStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub model: String,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUnavailableEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub model: String,
}

/// One event per dispatch attempt, consumed by ambient logging (§1A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub at: SystemTime,
    pub trace_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub fallback_index: u32,
    pub retry_count: u32,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum DispatchOutcome {
    Success,
    Retrying,
    FallbackAdvance,
    Exhausted,
}
