//! Plugin Pipeline (C6): ordered pre/post hooks around provider dispatch,
//! with symmetric cleanup even on panic, cancellation, or short-circuit.
//!
//! Plugins are registered once as a tagged-capability trait object rather
//! than one trait per capability (§9 "Plugin polymorphism") — the same
//! "capability set, presence tested" idiom the credential pool uses for its
//! optional event sinks. A plugin that doesn't implement a hook simply
//! inherits the default pass-through.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use ferrogate_common::CoreError;
use ferrogate_protocol::Req;

use crate::context::RequestContext;

/// What a pre-hook decided to do with the request.
pub enum PreHookOutcome {
    /// Forward traversal continues with the (possibly rewritten) request.
    Continue(Req),
    /// Stop forward traversal; enter the post-hook phase with this response.
    ShortCircuitResponse(Box<ferrogate_protocol::Resp>),
    /// Stop forward traversal; enter the post-hook phase with this error.
    ShortCircuitError(CoreError),
}

/// A pipeline stage. Every method defaults to a pass-through so a plugin
/// only overrides the capabilities it actually has.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_hook(&self, req: Req, _ctx: &RequestContext) -> PreHookOutcome {
        PreHookOutcome::Continue(req)
    }

    async fn post_hook(
        &self,
        resp: Option<ferrogate_protocol::Resp>,
        err: Option<CoreError>,
        _ctx: &RequestContext,
    ) -> (Option<ferrogate_protocol::Resp>, Option<CoreError>) {
        (resp, err)
    }

    /// Runs once per request for every plugin whose `pre_hook` executed,
    /// after all post-hooks — a release step distinct from response
    /// transformation (connection handles, timers, local caches).
    async fn cleanup(&self, _ctx: &RequestContext) {}
}

/// Outcome of running the forward pre-hook phase alone, used directly by
/// callers (like streaming dispatch) that can't hand the whole request
/// lifecycle to [`PluginPipeline::run`] as one future.
pub enum PrePhase {
    /// Nothing short-circuited; dispatch with this (possibly rewritten)
    /// request, then run post-hooks for plugins `0..=ran_upto`.
    Continue { req: Req, ran_upto: Option<usize> },
    /// A plugin short-circuited; post-hooks for `0..=ran_upto` still need to
    /// run over this response/error before cleanup.
    ShortCircuit {
        resp: Option<ferrogate_protocol::Resp>,
        err: Option<CoreError>,
        ran_upto: Option<usize>,
    },
}

pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for PluginPipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PluginPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs pre-hooks in list order (§4.6). A panic is treated the same as
    /// an explicit `ShortCircuitError`.
    pub async fn pre_phase(&self, mut req: Req, ctx: &RequestContext) -> PrePhase {
        let mut ran_upto: Option<usize> = None;

        for (i, plugin) in self.plugins.iter().enumerate() {
            ran_upto = Some(i);
            let outcome = AssertUnwindSafe(plugin.pre_hook(req, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(PreHookOutcome::Continue(next_req)) => {
                    req = next_req;
                }
                Ok(PreHookOutcome::ShortCircuitResponse(resp)) => {
                    return PrePhase::ShortCircuit {
                        resp: Some(*resp),
                        err: None,
                        ran_upto,
                    };
                }
                Ok(PreHookOutcome::ShortCircuitError(err)) => {
                    return PrePhase::ShortCircuit {
                        resp: None,
                        err: Some(err),
                        ran_upto,
                    };
                }
                Err(_panic) => {
                    tracing::warn!(plugin = plugin.name(), "pre-hook panicked");
                    return PrePhase::ShortCircuit {
                        resp: None,
                        err: Some(CoreError::plugin_fault(format!(
                            "plugin {} panicked in pre_hook",
                            plugin.name()
                        ))),
                        ran_upto,
                    };
                }
            }
        }

        PrePhase::Continue { req, ran_upto }
    }

    /// Runs post-hooks in reverse order over plugins `0..=last`, then
    /// cleanup in the same reverse order. `last` is `None` when no pre-hook
    /// ran at all (empty pipeline), in which case this is a no-op.
    pub async fn post_phase(
        &self,
        last: Option<usize>,
        mut resp: Option<ferrogate_protocol::Resp>,
        mut err: Option<CoreError>,
        ctx: &RequestContext,
    ) -> (Option<ferrogate_protocol::Resp>, Option<CoreError>) {
        let Some(last) = last else {
            return (resp, err);
        };

        for plugin in self.plugins[..=last].iter().rev() {
            let outcome = AssertUnwindSafe(plugin.post_hook(resp, err, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok((new_resp, new_err)) => {
                    resp = new_resp;
                    err = new_err;
                }
                Err(_panic) => {
                    tracing::warn!(plugin = plugin.name(), "post-hook panicked");
                    err = Some(CoreError::plugin_fault(format!(
                        "plugin {} panicked in post_hook",
                        plugin.name()
                    )));
                    resp = None;
                }
            }
        }

        for plugin in self.plugins[..=last].iter().rev() {
            if AssertUnwindSafe(plugin.cleanup(ctx)).catch_unwind().await.is_err() {
                tracing::warn!(plugin = plugin.name(), "cleanup panicked");
            }
        }

        (resp, err)
    }

    /// Runs pre-hooks, invokes `dispatch` if nothing short-circuited, then
    /// runs post-hooks and cleanup (§4.6). The one-shot, non-streaming path.
    pub async fn run<F, Fut>(
        &self,
        req: Req,
        ctx: &RequestContext,
        dispatch: F,
    ) -> (Option<ferrogate_protocol::Resp>, Option<CoreError>)
    where
        F: FnOnce(Req) -> Fut,
        Fut: std::future::Future<Output = (Option<ferrogate_protocol::Resp>, Option<CoreError>)>,
    {
        let (resp, err, ran_upto) = match self.pre_phase(req, ctx).await {
            PrePhase::Continue { req, ran_upto } => {
                let (resp, err) = dispatch(req).await;
                (resp, err, ran_upto)
            }
            PrePhase::ShortCircuit { resp, err, ran_upto } => (resp, err, ran_upto),
        };

        self.post_phase(ran_upto, resp, err, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogate_protocol::{Input, Params, ProviderId, RequestKind};
    use ferrogate_tracing::TraceId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn req() -> Req {
        Req {
            request_id: ferrogate_common::RequestId::generate(),
            kind: RequestKind::ChatCompletion,
            provider: ProviderId::OpenAI,
            model: "gpt-4o-mini".into(),
            fallbacks: vec![],
            input: Input::Chat { messages: vec![] },
            params: Params::default(),
            metadata: HashMap::new(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(TraceId::generate())
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn pre_hook(&self, req: Req, _ctx: &RequestContext) -> PreHookOutcome {
            self.log.lock().unwrap().push(format!("{}:pre", self.name));
            PreHookOutcome::Continue(req)
        }

        async fn post_hook(
            &self,
            resp: Option<ferrogate_protocol::Resp>,
            err: Option<CoreError>,
            _ctx: &RequestContext,
        ) -> (Option<ferrogate_protocol::Resp>, Option<CoreError>) {
            self.log.lock().unwrap().push(format!("{}:post", self.name));
            (resp, err)
        }
    }

    struct ShortCircuiter {
        at: &'static str,
    }

    #[async_trait]
    impl Plugin for ShortCircuiter {
        fn name(&self) -> &str {
            self.at
        }

        async fn pre_hook(&self, _req: Req, _ctx: &RequestContext) -> PreHookOutcome {
            PreHookOutcome::ShortCircuitError(CoreError::internal("cache miss, deliberate stop"))
        }
    }

    #[tokio::test]
    async fn post_hooks_run_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            Arc::new(Recorder { name: "a", log: log.clone() }),
            Arc::new(Recorder { name: "b", log: log.clone() }),
        ]);
        let dispatched = AtomicUsize::new(0);
        let (resp, err) = pipeline
            .run(req(), &ctx(), |_req| async {
                dispatched.fetch_add(1, Ordering::SeqCst);
                (None, Some(CoreError::internal("no adapter in this test")))
            })
            .await;
        assert!(resp.is_none());
        assert!(err.is_some());
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a:pre", "b:pre", "b:post", "a:post"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_dispatch_and_only_runs_post_hooks_up_to_its_index() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            Arc::new(Recorder { name: "a", log: log.clone() }),
            Arc::new(ShortCircuiter { at: "b" }),
            Arc::new(Recorder { name: "c", log: log.clone() }),
        ]);
        let dispatched = AtomicUsize::new(0);
        let (resp, err) = pipeline
            .run(req(), &ctx(), |_req| async {
                dispatched.fetch_add(1, Ordering::SeqCst);
                (None, None)
            })
            .await;
        assert!(resp.is_none());
        assert!(err.is_some());
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        // "c" never ran its pre-hook, so it must not run post-hook either.
        assert_eq!(*log.lock().unwrap(), vec!["a:pre", "a:post"]);
    }

    struct Panicker;

    #[async_trait]
    impl Plugin for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn pre_hook(&self, _req: Req, _ctx: &RequestContext) -> PreHookOutcome {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn pre_hook_panic_is_captured_as_plugin_fault_not_propagated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            Arc::new(Recorder { name: "a", log: log.clone() }),
            Arc::new(Panicker),
        ]);
        let (resp, err) = pipeline
            .run(req(), &ctx(), |_req| async { (None, None) })
            .await;
        assert!(resp.is_none());
        let err = err.expect("panic must surface as a PluginFault");
        assert_eq!(err.kind, ferrogate_common::ErrorKind::PluginFault);
        assert_eq!(*log.lock().unwrap(), vec!["a:pre", "a:post"]);
    }
}
