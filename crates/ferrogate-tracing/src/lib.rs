//! Distributed Tracing Core (C10): trace/span lifecycle with W3C
//! `traceparent` inheritance and TTL-based eviction of orphaned traces.

pub mod ids;
pub mod span;
pub mod store;
pub mod trace;
pub mod traceparent;

pub use ids::{SpanId, TraceId};
pub use span::{Span, SpanEvent, SpanKind, SpanStatus};
pub use store::TraceStore;
pub use trace::Trace;
pub use traceparent::{Traceparent, TraceparentError};
