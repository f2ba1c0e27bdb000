use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use ferrogate_common::Poolable;

use crate::ids::{SpanId, TraceId};
use crate::span::Span;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    /// External parent span id inherited from an incoming W3C `traceparent`,
    /// if this trace did not originate here.
    pub parent_id: Option<SpanId>,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub spans: Vec<Span>,
    /// Span id of the first span created in this trace (§3 invariant: every
    /// trace has exactly one root span).
    pub root_span_id: Option<SpanId>,
}

impl Trace {
    pub fn new(trace_id: TraceId, parent_id: Option<SpanId>) -> Self {
        Self {
            trace_id,
            parent_id,
            start_time: SystemTime::now(),
            end_time: None,
            spans: Vec::new(),
            root_span_id: None,
        }
    }

    pub fn root_span(&self) -> Option<&Span> {
        self.root_span_id
            .as_ref()
            .and_then(|id| self.spans.iter().find(|s| &s.span_id == id))
    }
}

impl Poolable for Trace {
    /// Resets for pooling (C2). `trace_id`/`parent_id` are overwritten by the
    /// caller right after acquiring, so only `start_time` needs a fresh value
    /// here — a reused `Trace` must not carry its previous occupant's age
    /// into the TTL reaper.
    fn reset(&mut self) {
        self.spans.clear();
        self.end_time = None;
        self.root_span_id = None;
        self.parent_id = None;
        self.start_time = SystemTime::now();
    }
}
