use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum Provider {
    Openai,
    Anthropic,
}

impl Provider {
    pub(crate) fn as_id(self) -> ferrogate_protocol::ProviderId {
        match self {
            Provider::Openai => ferrogate_protocol::ProviderId::OpenAI,
            Provider::Anthropic => ferrogate_protocol::ProviderId::Anthropic,
        }
    }
}

/// A thin demonstration binary: wires one `Dispatcher` with the two
/// reference adapters and runs a single chat request through it, printing
/// the resulting `Resp` (or streamed deltas) as JSON.
#[derive(Parser)]
#[command(name = "ferrogate")]
pub(crate) struct Cli {
    #[arg(long, value_enum, default_value_t = Provider::Openai)]
    pub(crate) provider: Provider,
    #[arg(long)]
    pub(crate) model: String,
    #[arg(long)]
    pub(crate) prompt: String,
    #[arg(long, env = "FERROGATE_API_KEY")]
    pub(crate) api_key: String,
    #[arg(long)]
    pub(crate) stream: bool,
    /// Optional sea-orm DSN to read provider/key configuration from instead
    /// of the single key supplied on the command line.
    #[arg(long)]
    pub(crate) dsn: Option<String>,
}
