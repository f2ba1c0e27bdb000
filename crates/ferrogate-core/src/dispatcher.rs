//! Dispatcher (C7): the single entry point tying the Provider Adapter
//! Registry, Worker Pool Manager, Key Selector, Plugin Pipeline, MCP Manager,
//! and Tracing Store together.
//!
//! `Dispatcher` bundles its collaborators the way the corpus's `CoreState`
//! bundles its own — except `execute`/`execute_stream` replace `CoreState`'s
//! axum-routed `call`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

use ferrogate_accumulator::StreamAccumulator;
use ferrogate_common::{CoreError, ErrorKind};
use ferrogate_mcp::{McpManager, ToolCall, ToolCallResult};
use ferrogate_protocol::{Key, ProviderConfig, ProviderId, Req, Resp, StreamEvent, ToolDefinition};
use ferrogate_provider_core::{KeySelector, ProviderRegistry};
use ferrogate_tracing::{SpanKind, SpanStatus, TraceStore};

use crate::context::RequestContext;
use crate::plugin::{PluginPipeline, PrePhase};
use crate::worker_pool::WorkerPoolManager;

/// Stream channel depth (§4.8): deltas are forwarded to the caller as they
/// decode, so this only needs to absorb brief scheduling jitter, not buffer
/// a whole response.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Exponential backoff with full jitter (§4.7 step 6d), parameterized by the
/// attempting provider's own `RetryBackoffInitialMs`/`RetryBackoffMaxMs`
/// rather than a single fixed base, generalizing the corpus's
/// `retry_backoff_delay`.
/// The bound a single transport call is wrapped in: the provider's own
/// `request_timeout_ms`, or whatever remains of the caller's deadline,
/// whichever is shorter (spec.md "In-flight provider calls must honor the
/// deadline by transport-level abort").
fn call_timeout_for(ctx: &RequestContext, request_timeout_ms: u64) -> Duration {
    let configured = Duration::from_millis(request_timeout_ms);
    match ctx.remaining() {
        Some(remaining) => configured.min(remaining),
        None => configured,
    }
}

fn retry_backoff_delay(attempt_no: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let step = attempt_no.saturating_sub(1).min(6);
    let backoff = initial_ms.saturating_mul(1u64 << step);
    let jitter = if initial_ms == 0 {
        0
    } else {
        rand::random::<u64>() % (initial_ms + 1)
    };
    Duration::from_millis((backoff + jitter).min(max_ms.max(1)))
}

pub struct Dispatcher {
    providers: std::sync::Arc<ProviderRegistry>,
    workers: std::sync::Arc<WorkerPoolManager>,
    keys: std::sync::Arc<KeySelector>,
    plugins: std::sync::Arc<PluginPipeline>,
    mcp: Option<std::sync::Arc<McpManager>>,
    traces: std::sync::Arc<TraceStore>,
    configs: RwLock<HashMap<String, ProviderConfig>>,
}

impl Dispatcher {
    pub fn new(
        providers: std::sync::Arc<ProviderRegistry>,
        workers: std::sync::Arc<WorkerPoolManager>,
        keys: std::sync::Arc<KeySelector>,
        plugins: std::sync::Arc<PluginPipeline>,
        mcp: Option<std::sync::Arc<McpManager>>,
        traces: std::sync::Arc<TraceStore>,
    ) -> Self {
        Self {
            providers,
            workers,
            keys,
            plugins,
            mcp,
            traces,
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_provider_config(&self, provider: &ProviderId, config: ProviderConfig) {
        self.configs
            .write()
            .await
            .insert(provider.to_string(), config);
    }

    async fn config_for(&self, provider: &ProviderId) -> Option<ProviderConfig> {
        self.configs.read().await.get(&provider.to_string()).cloned()
    }

    /// `Execute(ctx, Req) -> (Resp, Err)` for non-streaming kinds (§4.7, §6).
    pub async fn execute(&self, req: Req, ctx: &mut RequestContext) -> Result<Resp, CoreError> {
        let span_id = self
            .traces
            .start_span(ctx.trace_id(), "dispatch", SpanKind::Internal)
            .await?;
        ctx.set_span_id(span_id.clone());

        let pipeline = self.plugins.clone();
        let ctx_shared: &RequestContext = &*ctx;
        let (resp, err) = pipeline
            .run(req, ctx_shared, |req| async move {
                self.dispatch_with_fallbacks(req, ctx_shared).await
            })
            .await;

        let status = if err.is_some() { SpanStatus::Error } else { SpanStatus::Ok };
        let mut attrs = HashMap::new();
        if let Some(e) = &err {
            attrs.insert("error.kind".to_string(), format!("{:?}", e.kind));
            attrs.insert("error.message".to_string(), e.message.clone());
        }
        let _ = self
            .traces
            .end_span(ctx.trace_id(), &span_id, status, attrs)
            .await;

        match (resp, err) {
            (Some(resp), _) => Ok(resp),
            (None, Some(err)) => Err(err),
            (None, None) => Err(CoreError::internal("pipeline produced neither response nor error")),
        }
    }

    /// `ExecuteStream(ctx, Req) -> (chan StreamEvent, Err)` (§4.8, §6). The
    /// returned channel carries decoded deltas in wire order; the stream is
    /// fed into a [`StreamAccumulator`] in parallel so post-hooks still run
    /// exactly once over a synthesized response when the stream ends —
    /// including on cooperative cancellation (§9 "Streaming cancellation vs
    /// accumulator cleanup": the dispatcher signals stream end to the
    /// accumulator on cancellation just as on success).
    pub async fn execute_stream(
        self: &std::sync::Arc<Self>,
        req: Req,
        ctx: &mut RequestContext,
    ) -> Result<mpsc::Receiver<StreamEvent>, CoreError> {
        let span_id = self
            .traces
            .start_span(ctx.trace_id(), "dispatch_stream", SpanKind::Internal)
            .await?;
        ctx.set_span_id(span_id.clone());

        let ctx_shared: &RequestContext = &*ctx;
        let pre = self.plugins.pre_phase(req, ctx_shared).await;

        let (req, ran_upto) = match pre {
            PrePhase::Continue { req, ran_upto } => (req, ran_upto),
            PrePhase::ShortCircuit { resp, err, ran_upto } => {
                let (resp, err) = self.plugins.post_phase(ran_upto, resp, err, ctx_shared).await;
                let status = if err.is_some() { SpanStatus::Error } else { SpanStatus::Ok };
                let _ = self
                    .traces
                    .end_span(ctx.trace_id(), &span_id, status, HashMap::new())
                    .await;
                return match (resp, err) {
                    (_, Some(err)) => Err(err),
                    (Some(resp), None) => {
                        let (tx, rx) = mpsc::channel(1);
                        let _ = tx.send(StreamEvent::Final(resp_to_choice_delta(&resp))).await;
                        Ok(rx)
                    }
                    (None, None) => Err(CoreError::internal(
                        "pipeline produced neither response nor error",
                    )),
                };
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let dispatcher_traces = self.traces.clone();
        let trace_id = ctx.trace_id().clone();
        let ctx_owned = ctx.clone();
        let plugins = self.plugins.clone();
        let this = self.clone();

        tokio::spawn(async move {
            let (resp, err) = this
                .dispatch_stream_with_fallbacks(req, &ctx_owned, tx)
                .await;
            let (resp, err) = plugins.post_phase(ran_upto, resp, err, &ctx_owned).await;

            let status = if err.is_some() { SpanStatus::Error } else { SpanStatus::Ok };
            let mut attrs = HashMap::new();
            if let Some(e) = &err {
                attrs.insert("error.kind".to_string(), format!("{:?}", e.kind));
                attrs.insert("error.message".to_string(), e.message.clone());
            }
            let _ = dispatcher_traces
                .end_span(&trace_id, &span_id, status, attrs)
                .await;
        });

        Ok(rx)
    }

    /// `ExecuteMCPTool(ctx, ToolCall) -> (ToolResult, Err)` (§6).
    pub async fn execute_mcp_tool(
        &self,
        call: ToolCall,
        ctx: &RequestContext,
    ) -> Result<ToolCallResult, CoreError> {
        let manager = self
            .mcp
            .as_ref()
            .ok_or_else(|| CoreError::mcp_fault("no MCP manager configured"))?;
        manager
            .execute_tool(&call, ctx.tool_filter())
            .await
            .map_err(CoreError::from)
    }

    /// Merges the MCP catalogue (filtered per-request, §4.9) into
    /// `Req.Params.Tools`, then walks the attempt list (§4.7 steps 4-6).
    async fn dispatch_with_fallbacks(
        &self,
        mut req: Req,
        ctx: &RequestContext,
    ) -> (Option<Resp>, Option<CoreError>) {
        if req.kind.supports_tools()
            && let Some(manager) = &self.mcp
        {
            let tools = manager.catalogue_filtered(ctx.tool_filter()).await;
            req.params.tools.extend(tools.into_iter().map(|(qualified, def)| ToolDefinition {
                name: qualified,
                description: def.description,
                parameters: def.input_schema,
            }));
        }

        let attempts = req.attempts();
        let mut last_err = CoreError::no_key_available(req.provider.as_str());

        for (index, (provider, model)) in attempts.iter().enumerate() {
            if ctx.is_cancelled() {
                return (None, Some(CoreError::cancelled()));
            }

            match self.attempt(&req, ctx, provider, model, index as u32).await {
                Ok(resp) => return (Some(resp), None),
                Err(err) => {
                    let fatal = matches!(
                        err.kind,
                        ErrorKind::RequestCancelled | ErrorKind::DeadlineExceeded
                    );
                    last_err = err;
                    if fatal {
                        return (None, Some(last_err));
                    }
                }
            }
        }

        (None, Some(last_err))
    }

    /// One attempt `(provider, model)` (§4.7 step 6): submits to that
    /// provider's worker pool, then retries within the pool slot per the
    /// provider's own backoff policy until keys or retries are exhausted.
    async fn attempt(
        &self,
        req: &Req,
        ctx: &RequestContext,
        provider: &ProviderId,
        model: &str,
        fallback_index: u32,
    ) -> Result<Resp, CoreError> {
        let adapter = self
            .providers
            .get(provider.as_str())
            .await
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidRequest, format!("no adapter registered for {provider}")))?;

        if !adapter.supports(req.kind) {
            return Err(CoreError::new(
                ErrorKind::InvalidRequest,
                format!("provider {provider} does not support {:?}", req.kind),
            ));
        }

        let config = self
            .config_for(provider)
            .await
            .ok_or_else(|| CoreError::internal(format!("no config registered for provider {provider}")))?;

        let mut attempt_req = req.clone();
        attempt_req.provider = provider.clone();
        attempt_req.model = model.to_string();

        let provider_str = provider.as_str().to_string();
        let result = self
            .workers
            .submit(
                provider,
                config.concurrency as usize,
                config.buffer_size as usize,
                config.drop_excess_requests,
                || async move {
                    self.run_with_retries(attempt_req, provider_str, model, &config, fallback_index, ctx)
                        .await
                },
            )
            .await;

        match result {
            Ok(inner) => inner,
            Err(queue_full) => Err(queue_full),
        }
    }

    /// Key selection + retry loop for one already-admitted attempt (§4.7
    /// step 6b-6d). Every transport call and every backoff sleep is raced
    /// against `ctx`'s deadline/cancellation (spec.md "Worker encodes, calls
    /// provider transport with the context deadline" / "cancellation is
    /// propagated to the active transport call"), and each call is wrapped in
    /// a `tokio::time::timeout` bounded by whichever of the remaining context
    /// deadline or the provider's own `request_timeout_ms` is shorter.
    async fn run_with_retries(
        &self,
        req: Req,
        provider: String,
        model: &str,
        config: &ProviderConfig,
        fallback_index: u32,
        ctx: &RequestContext,
    ) -> Result<Resp, CoreError> {
        let started = tokio::time::Instant::now();
        // Retries (§4.7 step 6d) stay on the *same* key up to `MaxRetries`;
        // only once that key is exhausted does the attempt try one other
        // eligible key (§4.7's "a different eligible key once per attempt").
        let mut excluded = Vec::new();
        let mut switched_key_once = false;
        let mut retries_on_current_key = 0u32;
        let mut total_retries = 0u32;

        let mut key = self.keys.pick(&provider, model, req.kind, &excluded).await?;

        loop {
            if ctx.is_cancelled() {
                return Err(CoreError::cancelled());
            }

            let call_timeout = call_timeout_for(ctx, config.network.request_timeout_ms);
            let call_result = match ctx
                .race(tokio::time::timeout(
                    call_timeout,
                    adapter_call(&self.providers, &provider, &req, &key),
                ))
                .await
            {
                None => Err(CoreError::cancelled()),
                Some(Ok(inner)) => inner,
                Some(Err(_elapsed)) => Err(CoreError::new(
                    ErrorKind::ProviderTransport,
                    "provider call exceeded request_timeout_ms",
                )
                .retryable(true)),
            };

            match call_result {
                Ok(mut resp) => {
                    resp.extra.provider = Some(provider);
                    resp.extra.latency_ms = started.elapsed().as_millis() as u64;
                    resp.extra.key_id = Some(key.id);
                    resp.extra.retry_count = total_retries;
                    resp.extra.fallback_index = fallback_index;
                    return Ok(resp);
                }
                Err(err) => {
                    if matches!(
                        err.kind,
                        ErrorKind::RequestCancelled | ErrorKind::DeadlineExceeded
                    ) {
                        return Err(err);
                    }

                    if err.kind.retry_eligible()
                        && err.retryable
                        && retries_on_current_key < config.network.max_retries
                    {
                        retries_on_current_key += 1;
                        total_retries += 1;
                        let delay = retry_backoff_delay(
                            retries_on_current_key,
                            config.network.retry_backoff_initial_ms,
                            config.network.retry_backoff_max_ms,
                        );
                        if delay.as_millis() > 0 && ctx.race(tokio::time::sleep(delay)).await.is_none()
                        {
                            return Err(CoreError::cancelled());
                        }
                        continue;
                    }

                    if switched_key_once {
                        return Err(err);
                    }
                    excluded.push(key.id);
                    match self.keys.pick(&provider, model, req.kind, &excluded).await {
                        Ok(next_key) => {
                            key = next_key;
                            switched_key_once = true;
                            retries_on_current_key = 0;
                            total_retries += 1;
                            continue;
                        }
                        Err(_) => return Err(err),
                    }
                }
            }
        }
    }

    /// Streaming counterpart of [`Dispatcher::dispatch_with_fallbacks`]:
    /// same MCP merge and fallback walk, but each attempt forwards deltas to
    /// `tx` as they decode instead of returning one `Resp`.
    async fn dispatch_stream_with_fallbacks(
        &self,
        mut req: Req,
        ctx: &RequestContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> (Option<Resp>, Option<CoreError>) {
        if req.kind.supports_tools()
            && let Some(manager) = &self.mcp
        {
            let tools = manager.catalogue_filtered(ctx.tool_filter()).await;
            req.params.tools.extend(tools.into_iter().map(|(qualified, def)| ToolDefinition {
                name: qualified,
                description: def.description,
                parameters: def.input_schema,
            }));
        }

        let attempts = req.attempts();
        let mut last_err = CoreError::no_key_available(req.provider.as_str());

        for (index, (provider, model)) in attempts.iter().enumerate() {
            if ctx.is_cancelled() {
                return (None, Some(CoreError::cancelled()));
            }

            match self
                .attempt_stream(&req, ctx, provider, model, index as u32, tx.clone())
                .await
            {
                Ok(resp) => return (Some(resp), None),
                Err(err) => {
                    let fatal = matches!(
                        err.kind,
                        ErrorKind::RequestCancelled | ErrorKind::DeadlineExceeded
                    );
                    last_err = err;
                    if fatal {
                        return (None, Some(last_err));
                    }
                }
            }
        }

        (None, Some(last_err))
    }

    async fn attempt_stream(
        &self,
        req: &Req,
        ctx: &RequestContext,
        provider: &ProviderId,
        model: &str,
        fallback_index: u32,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Resp, CoreError> {
        let adapter = self
            .providers
            .get(provider.as_str())
            .await
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidRequest, format!("no adapter registered for {provider}")))?;

        if !adapter.supports(req.kind) {
            return Err(CoreError::new(
                ErrorKind::InvalidRequest,
                format!("provider {provider} does not support {:?}", req.kind),
            ));
        }

        let config = self
            .config_for(provider)
            .await
            .ok_or_else(|| CoreError::internal(format!("no config registered for provider {provider}")))?;

        let mut attempt_req = req.clone();
        attempt_req.provider = provider.clone();
        attempt_req.model = model.to_string();

        let provider_str = provider.as_str().to_string();
        let ctx = ctx.clone();
        self.workers
            .submit(
                provider,
                config.concurrency as usize,
                config.buffer_size as usize,
                config.drop_excess_requests,
                || async move {
                    self.run_stream_with_retries(
                        attempt_req,
                        provider_str,
                        model,
                        &config,
                        fallback_index,
                        &ctx,
                        tx,
                    )
                    .await
                },
            )
            .await?
    }

    /// Key selection + retry loop for one streaming attempt (§4.7, §4.8).
    /// Retries only apply before the provider's first chunk arrives — once
    /// any delta has reached the caller, a transport fault mid-stream
    /// finalizes the accumulator instead of silently retrying behind a
    /// partially-delivered response.
    async fn run_stream_with_retries(
        &self,
        req: Req,
        provider: String,
        model: &str,
        config: &ProviderConfig,
        fallback_index: u32,
        ctx: &RequestContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Resp, CoreError> {
        let started = tokio::time::Instant::now();
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut excluded = Vec::new();
        let mut switched_key_once = false;
        let mut retries_on_current_key = 0u32;
        let mut total_retries = 0u32;

        let mut key = self.keys.pick(&provider, model, req.kind, &excluded).await?;

        'attempt: loop {
            if ctx.is_cancelled() {
                return Err(CoreError::cancelled());
            }

            let call_timeout = call_timeout_for(ctx, config.network.request_timeout_ms);
            let established = match ctx
                .race(tokio::time::timeout(
                    call_timeout,
                    adapter_call_stream(&self.providers, &provider, &req, &key),
                ))
                .await
            {
                None => Err(CoreError::cancelled()),
                Some(Ok(inner)) => inner,
                Some(Err(_elapsed)) => Err(CoreError::new(
                    ErrorKind::ProviderTransport,
                    "provider call exceeded request_timeout_ms",
                )
                .retryable(true)),
            };

            let mut receiver = match established {
                Ok(receiver) => receiver,
                Err(err) => {
                    if matches!(
                        err.kind,
                        ErrorKind::RequestCancelled | ErrorKind::DeadlineExceeded
                    ) {
                        return Err(err);
                    }

                    if err.kind.retry_eligible()
                        && err.retryable
                        && retries_on_current_key < config.network.max_retries
                    {
                        retries_on_current_key += 1;
                        total_retries += 1;
                        let delay = retry_backoff_delay(
                            retries_on_current_key,
                            config.network.retry_backoff_initial_ms,
                            config.network.retry_backoff_max_ms,
                        );
                        if delay.as_millis() > 0 && ctx.race(tokio::time::sleep(delay)).await.is_none()
                        {
                            return Err(CoreError::cancelled());
                        }
                        continue 'attempt;
                    }
                    if switched_key_once {
                        return Err(err);
                    }
                    excluded.push(key.id);
                    match self.keys.pick(&provider, model, req.kind, &excluded).await {
                        Ok(next_key) => {
                            key = next_key;
                            switched_key_once = true;
                            retries_on_current_key = 0;
                            total_retries += 1;
                            continue 'attempt;
                        }
                        Err(_) => return Err(err),
                    }
                }
            };

            let mut accumulator = StreamAccumulator::new(req.request_id.to_string(), model.to_string(), created);

            loop {
                let next = ctx.race(receiver.recv()).await;
                let item = match next {
                    None => {
                        let mut resp = accumulator.finalize_on_cancel();
                        populate_extra(&mut resp, &provider, started, key.id, total_retries, fallback_index);
                        return Ok(resp);
                    }
                    Some(None) => {
                        let mut resp = accumulator.finalize();
                        populate_extra(&mut resp, &provider, started, key.id, total_retries, fallback_index);
                        return Ok(resp);
                    }
                    Some(Some(Ok(event))) => event,
                    Some(Some(Err(err))) => {
                        if accumulator.ttft_ms().is_none()
                            && err.kind.retry_eligible()
                            && err.retryable
                            && retries_on_current_key < config.network.max_retries
                        {
                            retries_on_current_key += 1;
                            total_retries += 1;
                            let delay = retry_backoff_delay(
                                retries_on_current_key,
                                config.network.retry_backoff_initial_ms,
                                config.network.retry_backoff_max_ms,
                            );
                            if delay.as_millis() > 0 && ctx.race(tokio::time::sleep(delay)).await.is_none()
                            {
                                let mut resp = accumulator.finalize_on_cancel();
                                populate_extra(&mut resp, &provider, started, key.id, total_retries, fallback_index);
                                return Ok(resp);
                            }
                            continue 'attempt;
                        }
                        let mut resp = accumulator.finalize_on_cancel();
                        populate_extra(&mut resp, &provider, started, key.id, total_retries, fallback_index);
                        return Ok(resp);
                    }
                };

                let _ = tx.send(item.clone()).await;
                if let Some(mut resp) = accumulator.push_event(item) {
                    populate_extra(&mut resp, &provider, started, key.id, total_retries, fallback_index);
                    return Ok(resp);
                }
            }
        }
    }

    /// Closes every provider's admission gate, drains queued tasks with
    /// `RequestCancelled`, waits for in-flight tasks up to that provider's
    /// own `request_timeout_ms`, then shuts down the MCP manager (spec.md
    /// "Cleanup closes the admission gate, drains queued tasks... waits for
    /// in-flight tasks to complete... then releases workers").
    pub async fn cleanup(&self) {
        let configs = self.configs.read().await.clone();
        let waits = configs.iter().map(|(provider_key, config)| {
            self.workers.cleanup(
                provider_key,
                Duration::from_millis(config.network.request_timeout_ms),
            )
        });
        futures_util::future::join_all(waits).await;

        if let Some(mcp) = &self.mcp {
            mcp.shutdown().await;
        }
    }
}

fn populate_extra(
    resp: &mut Resp,
    provider: &str,
    started: tokio::time::Instant,
    key_id: ferrogate_common::CredentialId,
    total_retries: u32,
    fallback_index: u32,
) {
    resp.extra.provider = Some(provider.to_string());
    resp.extra.latency_ms = started.elapsed().as_millis() as u64;
    resp.extra.key_id = Some(key_id);
    resp.extra.retry_count = total_retries;
    resp.extra.fallback_index = fallback_index;
}

/// Best-effort conversion of a one-shot short-circuited response into a
/// single terminal delta, for plugins that short-circuit `ExecuteStream`
/// with a synthesized [`Resp`] rather than letting the provider stream.
fn resp_to_choice_delta(resp: &Resp) -> ferrogate_protocol::ChoiceDelta {
    match &resp.body {
        ferrogate_protocol::RespBody::Chat(chat) => chat
            .choices
            .first()
            .map(|choice| ferrogate_protocol::ChoiceDelta {
                index: choice.index,
                role: Some(choice.role.clone()),
                content: Some(choice.content.clone()),
                finish_reason: choice.finish_reason.clone(),
                usage: resp.usage.clone(),
                ..Default::default()
            })
            .unwrap_or_default(),
        _ => ferrogate_protocol::ChoiceDelta {
            finish_reason: Some("stop".to_string()),
            usage: resp.usage.clone(),
            ..Default::default()
        },
    }
}

async fn adapter_call_stream(
    providers: &ProviderRegistry,
    provider: &str,
    req: &Req,
    key: &Key,
) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError> {
    let adapter = providers
        .get(provider)
        .await
        .ok_or_else(|| CoreError::internal(format!("adapter {provider} vanished from registry mid-attempt")))?;
    adapter.call_stream(req, key).await
}

async fn adapter_call(
    providers: &ProviderRegistry,
    provider: &str,
    req: &Req,
    key: &ferrogate_protocol::Key,
) -> Result<Resp, CoreError> {
    let adapter = providers
        .get(provider)
        .await
        .ok_or_else(|| CoreError::internal(format!("adapter {provider} vanished from registry mid-attempt")))?;
    adapter.call(req, key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferrogate_protocol::{ChatChoice, ChatResponse, Input, Key, KeyValue, Params, RequestKind, RespBody};
    use ferrogate_provider_core::{EventHub, ProviderAdapter};
    use ferrogate_tracing::TraceId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyAdapter {
        name: String,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        fn supports(&self, _kind: RequestKind) -> bool {
            true
        }
        async fn encode_request(&self, _req: &Req, _key: &Key) -> Result<Vec<u8>, CoreError> {
            Ok(Vec::new())
        }
        async fn decode_response(&self, _wire: &[u8]) -> Result<Resp, CoreError> {
            unreachable!("test adapter calls directly")
        }
        async fn decode_stream_chunk(
            &self,
            _bytes: &[u8],
        ) -> Result<ferrogate_protocol::StreamEvent, CoreError> {
            unreachable!()
        }
        fn classify(&self, _status: u16, _body: &[u8]) -> ferrogate_provider_core::Classification {
            ferrogate_provider_core::Classification {
                retryable: true,
                kind: ErrorKind::ProviderTransport,
                message: "transient".into(),
            }
        }
        async fn call_stream(
            &self,
            _req: &Req,
            _key: &Key,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<ferrogate_protocol::StreamEvent, CoreError>>, CoreError>
        {
            unreachable!("test adapter exercises the non-streaming path only")
        }
        async fn call(&self, _req: &Req, _key: &Key) -> Result<Resp, CoreError> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(CoreError::new(ErrorKind::ProviderTransport, "flaky").retryable(true));
            }
            Ok(Resp {
                id: "resp-1".into(),
                model: "gpt-4o-mini".into(),
                created: 0,
                body: RespBody::Chat(ChatResponse {
                    choices: vec![ChatChoice {
                        index: 0,
                        role: "assistant".into(),
                        content: "hello".into(),
                        ..Default::default()
                    }],
                }),
                usage: None,
                service_tier: None,
                extra: Default::default(),
            })
        }
    }

    struct StreamingAdapter {
        name: String,
    }

    #[async_trait]
    impl ProviderAdapter for StreamingAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        fn supports(&self, _kind: RequestKind) -> bool {
            true
        }
        async fn encode_request(&self, _req: &Req, _key: &Key) -> Result<Vec<u8>, CoreError> {
            Ok(Vec::new())
        }
        async fn decode_response(&self, _wire: &[u8]) -> Result<Resp, CoreError> {
            unreachable!()
        }
        async fn decode_stream_chunk(
            &self,
            _bytes: &[u8],
        ) -> Result<ferrogate_protocol::StreamEvent, CoreError> {
            unreachable!()
        }
        fn classify(&self, _status: u16, _body: &[u8]) -> ferrogate_provider_core::Classification {
            ferrogate_provider_core::Classification {
                retryable: true,
                kind: ErrorKind::ProviderTransport,
                message: "transient".into(),
            }
        }
        async fn call(&self, _req: &Req, _key: &Key) -> Result<Resp, CoreError> {
            unreachable!("test adapter exercises the streaming path only")
        }
        async fn call_stream(
            &self,
            _req: &Req,
            _key: &Key,
        ) -> Result<tokio::sync::mpsc::Receiver<Result<ferrogate_protocol::StreamEvent, CoreError>>, CoreError>
        {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(StreamEvent::Delta(ferrogate_protocol::ChoiceDelta {
                        index: 0,
                        role: Some("assistant".into()),
                        content: Some("h".into()),
                        ..Default::default()
                    })))
                    .await;
                let _ = tx
                    .send(Ok(StreamEvent::Final(ferrogate_protocol::ChoiceDelta {
                        index: 0,
                        content: Some("i".into()),
                        finish_reason: Some("stop".into()),
                        ..Default::default()
                    })))
                    .await;
            });
            Ok(rx)
        }
    }

    fn chat_req() -> Req {
        Req {
            request_id: ferrogate_common::RequestId::generate(),
            kind: RequestKind::ChatCompletion,
            provider: ProviderId::OpenAI,
            model: "gpt-4o-mini".into(),
            fallbacks: vec![],
            input: Input::Chat { messages: vec![] },
            params: Params::default(),
            metadata: Default::default(),
        }
    }

    fn provider_config() -> ProviderConfig {
        ProviderConfig {
            network: ferrogate_protocol::NetworkConfig {
                base_url: None,
                headers: Default::default(),
                request_timeout_ms: 5_000,
                max_retries: 3,
                retry_backoff_initial_ms: 1,
                retry_backoff_max_ms: 10,
            },
            concurrency: 2,
            buffer_size: 4,
            drop_excess_requests: false,
            proxy: None,
            custom_provider: None,
            send_back_raw: Default::default(),
        }
    }

    async fn dispatcher_with(adapter: impl ProviderAdapter + 'static) -> Arc<Dispatcher> {
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(Arc::new(adapter)).await;

        let keys = Arc::new(KeySelector::new(EventHub::new(16)));
        keys.load_provider_keys(
            "openai",
            vec![Key {
                id: 1,
                name: "k1".into(),
                value: KeyValue::Plain("sk-x".into()),
                eligible_models: vec![],
                weight: 1,
                enabled: true,
                use_for_batch_api: false,
            }],
        )
        .await;

        let dispatcher = Dispatcher::new(
            providers,
            Arc::new(WorkerPoolManager::new()),
            keys,
            Arc::new(PluginPipeline::default()),
            None,
            Arc::new(TraceStore::new(Duration::from_secs(3600))),
        );
        dispatcher
            .register_provider_config(&ProviderId::OpenAI, provider_config())
            .await;
        Arc::new(dispatcher)
    }

    /// Builds a [`RequestContext`] over a trace actually registered with the
    /// dispatcher's own `TraceStore` — `start_span` rejects unknown trace
    /// ids, so tests can't just hand it a bare `TraceId::generate()`.
    async fn ctx_for(dispatcher: &Dispatcher) -> RequestContext {
        let trace_id = dispatcher.traces.create_trace(None).await;
        RequestContext::new(trace_id)
    }

    #[tokio::test]
    async fn primary_succeeds_populates_extra_fields() {
        let dispatcher = dispatcher_with(FlakyAdapter {
            name: "openai".into(),
            fail_times: AtomicU32::new(0),
        })
        .await;
        let mut ctx = ctx_for(&dispatcher).await;
        let resp = dispatcher.execute(chat_req(), &mut ctx).await.unwrap();
        assert_eq!(resp.extra.provider.as_deref(), Some("openai"));
        assert_eq!(resp.extra.fallback_index, 0);
        assert_eq!(resp.extra.retry_count, 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_before_succeeding() {
        let dispatcher = dispatcher_with(FlakyAdapter {
            name: "openai".into(),
            fail_times: AtomicU32::new(2),
        })
        .await;
        let mut ctx = ctx_for(&dispatcher).await;
        let resp = dispatcher.execute(chat_req(), &mut ctx).await.unwrap();
        assert_eq!(resp.extra.retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_with_no_fallback_returns_the_error() {
        let dispatcher = dispatcher_with(FlakyAdapter {
            name: "openai".into(),
            fail_times: AtomicU32::new(100),
        })
        .await;
        let mut ctx = ctx_for(&dispatcher).await;
        let err = dispatcher.execute(chat_req(), &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderTransport);
    }

    #[tokio::test]
    async fn execute_stream_forwards_deltas_in_order() {
        let dispatcher = dispatcher_with(StreamingAdapter {
            name: "openai".into(),
        })
        .await;
        let mut ctx = ctx_for(&dispatcher).await;
        let mut rx = dispatcher
            .execute_stream(chat_req(), &mut ctx)
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Delta(delta) | StreamEvent::Final(delta) = event {
                if let Some(content) = delta.content {
                    chunks.push(content);
                }
            }
        }
        assert_eq!(chunks, vec!["h".to_string(), "i".to_string()]);
    }
}
