pub mod context;
pub mod dispatcher;
pub mod plugin;
pub mod pool;
pub mod worker_pool;

pub use context::{RequestContext, Tenancy};
pub use dispatcher::Dispatcher;
pub use plugin::{Plugin, PluginPipeline, PreHookOutcome, PrePhase};
pub use pool::{Pool, Poolable};
pub use worker_pool::WorkerPoolManager;
