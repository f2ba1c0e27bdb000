//! Context & Config (C11): scoped per-request context — deadline,
//! cancellation, trace linkage, tenancy keys, MCP filters.
//!
//! §9 open question: the source mixes context key spellings
//! (`mcp_include_clients` vs `mcp-include-clients`). Decision: the canonical
//! dotted form (§6) is the only accepted shape, and `RequestContext` exposes
//! typed accessors rather than raw string lookups — there is no surface for a
//! caller to pass an alias.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ferrogate_mcp::ToolFilter;
use ferrogate_tracing::{SpanId, TraceId};

/// Canonical dotted context-key names (§6), kept only as documentation for
/// the accessors below — there is no string-keyed lookup surface.
pub mod keys {
    pub const TRACE_ID: &str = "trace.id";
    pub const SPAN_ID: &str = "span.id";
    pub const PARENT_SPAN_ID: &str = "parent.span.id";
    pub const REQUEST_ID: &str = "request.id";
    pub const MCP_INCLUDE_CLIENTS: &str = "mcp.include_clients";
    pub const MCP_EXCLUDE_CLIENTS: &str = "mcp.exclude_clients";
    pub const MCP_INCLUDE_TOOLS: &str = "mcp.include_tools";
    pub const MCP_EXCLUDE_TOOLS: &str = "mcp.exclude_tools";
    pub const ACCUMULATOR_ID: &str = "accumulator.id";
    pub const STREAM_END: &str = "stream.end";
}

/// Tenancy keys carried opaquely by the core, surfaced on tracing attributes
/// (§6 "Context attrs").
#[derive(Debug, Clone, Default)]
pub struct Tenancy {
    pub virtual_key_id: Option<String>,
    pub team_id: Option<String>,
    pub customer_id: Option<String>,
}

/// Per-request scoped state threaded through dispatch, plugin hooks, and MCP
/// tool execution.
#[derive(Debug, Clone)]
pub struct RequestContext {
    trace_id: TraceId,
    span_id: Option<SpanId>,
    parent_span_id: Option<SpanId>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    tenancy: Tenancy,
    tool_filter: ToolFilter,
}

impl RequestContext {
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            span_id: None,
            parent_span_id: None,
            deadline: None,
            cancellation: CancellationToken::new(),
            tenancy: Tenancy::default(),
            tool_filter: ToolFilter::default(),
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_tenancy(mut self, tenancy: Tenancy) -> Self {
        self.tenancy = tenancy;
        self
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = filter;
        self
    }

    pub fn with_parent_span(mut self, parent: SpanId) -> Self {
        self.parent_span_id = Some(parent);
        self
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn span_id(&self) -> Option<&SpanId> {
        self.span_id.as_ref()
    }

    pub fn set_span_id(&mut self, span_id: SpanId) {
        self.span_id = Some(span_id);
    }

    pub fn parent_span_id(&self) -> Option<&SpanId> {
        self.parent_span_id.as_ref()
    }

    pub fn tenancy(&self) -> &Tenancy {
        &self.tenancy
    }

    pub fn tool_filter(&self) -> &ToolFilter {
        &self.tool_filter
    }

    /// Remaining time before the caller's deadline, or `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Races `fut` against the caller's deadline and cancellation, whichever
    /// comes first. Returns `None` on either.
    pub async fn race<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        let cancelled = self.cancellation.cancelled();
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    res = fut => Some(res),
                    _ = tokio::time::sleep_until(deadline) => None,
                    _ = cancelled => None,
                }
            }
            None => {
                tokio::select! {
                    res = fut => Some(res),
                    _ = cancelled => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_returns_none_once_cancelled() {
        let ctx = RequestContext::new(TraceId::generate());
        let token = ctx.cancellation_token();
        token.cancel();
        let result = ctx
            .race(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                42
            })
            .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn race_returns_some_when_future_completes_first() {
        let ctx = RequestContext::new(TraceId::generate());
        let result = ctx.race(async { 7 }).await;
        assert_eq!(result, Some(7));
    }

    #[test]
    fn remaining_is_none_without_a_deadline() {
        let ctx = RequestContext::new(TraceId::generate());
        assert!(ctx.remaining().is_none());
    }
}
