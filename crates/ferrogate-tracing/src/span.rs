use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use ferrogate_common::Poolable;

use crate::ids::{SpanId, TraceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    ProviderCall,
    PluginHook,
    McpCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub at: SystemTime,
    pub name: String,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub status: SpanStatus,
    pub attributes: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
}

impl Span {
    pub fn new(trace_id: TraceId, parent_id: Option<SpanId>, name: String, kind: SpanKind) -> Self {
        Self {
            span_id: SpanId::generate(),
            trace_id,
            parent_id,
            name,
            kind,
            start_time: SystemTime::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: HashMap::new(),
            events: Vec::new(),
        }
    }

}

impl Poolable for Span {
    /// Resets to a zero-allocated-but-reusable state for pooling (C2). Every
    /// other field is overwritten by the caller right after acquiring, so
    /// `start_time` is the one value that must be refreshed here.
    fn reset(&mut self) {
        self.attributes.clear();
        self.events.clear();
        self.end_time = None;
        self.status = SpanStatus::Unset;
        self.start_time = SystemTime::now();
    }
}
