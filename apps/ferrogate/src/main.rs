use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use ferrogate_core::{Dispatcher, PluginPipeline, RequestContext, WorkerPoolManager};
use ferrogate_protocol::{
    ChatMessage, Input, Key, KeyValue, NetworkConfig, Params, ProviderConfig, Req, RequestKind,
    SendBackRaw,
};
use ferrogate_provider_core::{EventHub, KeyRegistry, KeySelector, ProviderRegistry};
use ferrogate_provider_impl::{AnthropicAdapter, OpenAiAdapter};
use ferrogate_storage::{SeaOrmKeyRegistry, StaticKeyRegistry};
use ferrogate_tracing::TraceStore;

mod cli;

use cli::Cli;

fn default_network_config() -> NetworkConfig {
    NetworkConfig {
        base_url: None,
        headers: HashMap::new(),
        request_timeout_ms: 30_000,
        max_retries: 2,
        retry_backoff_initial_ms: 200,
        retry_backoff_max_ms: 5_000,
    }
}

fn default_provider_config() -> ProviderConfig {
    ProviderConfig {
        network: default_network_config(),
        concurrency: 4,
        buffer_size: 32,
        drop_excess_requests: false,
        proxy: None,
        custom_provider: None,
        send_back_raw: SendBackRaw::default(),
    }
}

async fn registry_from_cli(cli: &Cli) -> Result<Box<dyn KeyRegistry>> {
    if let Some(dsn) = &cli.dsn {
        let conn = ferrogate_storage::db::connect_shared(dsn)
            .await
            .context("connecting to configured DSN")?;
        return Ok(Box::new(SeaOrmKeyRegistry::new(conn)));
    }

    let key = Key {
        id: 1,
        name: "cli".into(),
        value: KeyValue::Plain(cli.api_key.clone()),
        eligible_models: vec![],
        weight: 1,
        enabled: true,
        use_for_batch_api: false,
    };
    Ok(Box::new(
        StaticKeyRegistry::new().with_provider(cli.provider.as_id(), default_provider_config(), vec![key]),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let providers = Arc::new(ProviderRegistry::new());
    providers.register(Arc::new(OpenAiAdapter::new())).await;
    providers.register(Arc::new(AnthropicAdapter::new())).await;

    let registry = registry_from_cli(&cli).await?;
    let provider_id = cli.provider.as_id();
    let config = registry
        .config_for_provider(&provider_id)
        .await
        .context("loading provider config")?;
    let keys = registry
        .keys_for_provider(&provider_id)
        .await
        .context("loading provider keys")?;

    let key_selector = Arc::new(KeySelector::new(EventHub::new(64)));
    key_selector.load_provider_keys(provider_id.as_str(), keys).await;

    let workers = Arc::new(WorkerPoolManager::new());
    let plugins = Arc::new(PluginPipeline::default());
    let traces = Arc::new(TraceStore::new(Duration::from_secs(300)));

    let dispatcher = Arc::new(Dispatcher::new(
        providers,
        workers,
        key_selector,
        plugins,
        None,
        traces.clone(),
    ));
    dispatcher.register_provider_config(&provider_id, config).await;

    let kind = if cli.stream {
        RequestKind::ChatCompletionStream
    } else {
        RequestKind::ChatCompletion
    };

    let req = Req {
        request_id: ferrogate_common::RequestId::generate(),
        kind,
        provider: provider_id,
        model: cli.model.clone(),
        fallbacks: vec![],
        input: Input::Chat {
            messages: vec![ChatMessage {
                role: "user".into(),
                content: cli.prompt.clone(),
                name: None,
                tool_call_id: None,
            }],
        },
        params: Params::default(),
        metadata: HashMap::new(),
    };

    let trace_id = traces.create_trace(None).await;
    let mut ctx = RequestContext::new(trace_id.clone());

    if cli.stream {
        let mut rx = dispatcher.execute_stream(req, &mut ctx).await?;
        while let Some(event) = rx.recv().await {
            println!("{}", serde_json::to_string(&event)?);
        }
    } else {
        let resp = dispatcher.execute(req, &mut ctx).await?;
        println!("{}", serde_json::to_string_pretty(&resp)?);
    }

    if let Ok(trace) = traces.complete_trace(&trace_id).await {
        traces.release_trace(trace).await;
    }

    Ok(())
}
