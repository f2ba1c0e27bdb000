//! Core provider abstractions for the gateway.
//!
//! This crate intentionally does **not** depend on axum, any concrete HTTP
//! client, or any provider wire format. It owns only the seams the core
//! dispatcher needs: the Account/Key Registry (C1), the Key Selector (C5),
//! the Provider Adapter Registry (C3), and ambient operational events.

pub mod adapter;
pub mod credential;
pub mod events;
pub mod registry;

pub use adapter::{Classification, ProviderAdapter, ProviderRegistry};
pub use credential::{CredentialState, KeySelector, UnavailableReason};
pub use events::{
    DispatchEvent, DispatchOutcome, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent,
};
pub use registry::KeyRegistry;
