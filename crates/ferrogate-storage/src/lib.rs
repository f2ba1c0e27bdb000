//! Persistence for the Account / Key Registry (C1). Kept deliberately
//! narrow: this crate owns exactly the `KeyRegistry` trait's backing store
//! and nothing else — no traffic logging, no admin surface, no usage
//! aggregation.

pub mod db;
pub mod entities;
pub mod registry;

pub use registry::{SeaOrmKeyRegistry, StaticKeyRegistry};
