//! Object Pools (C2): re-exported from `ferrogate-common` so that both this
//! crate and `ferrogate-tracing` (which sits below `ferrogate-core` in the
//! dependency graph and cannot depend on it) can share one `Pool<T>`
//! implementation instead of duplicating it.
pub use ferrogate_common::pool::{Pool, Poolable};
