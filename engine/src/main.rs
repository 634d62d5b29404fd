use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge_core::{BridgeConfig, LogFormat};

const SERVE_EXAMPLES: &str = r#"Examples:
  companion-bridge serve
  companion-bridge serve --port 8084 --companion-url http://127.0.0.1:3000
  COMPANION_URL=http://127.0.0.1:3000 TOOL_MODE=passthrough companion-bridge
"#;

#[derive(Parser)]
#[command(
    name = "companion-bridge",
    version,
    about = "OpenAI-compatible chat endpoint bridging to a Companion-hosted coding agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP adapter (the default when no subcommand is given).
    #[command(after_help = SERVE_EXAMPLES)]
    Serve {
        /// Listen port; overrides ADAPTER_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Companion base URL; overrides COMPANION_URL.
        #[arg(long)]
        companion_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env();
    if let Some(Command::Serve {
        port,
        companion_url,
    }) = cli.command
    {
        if let Some(port) = port {
            config.port = port;
        }
        if let Some(url) = companion_url {
            config.companion_url = url.trim_end_matches('/').to_string();
        }
    }

    init_logging(config.log_format);
    info!(
        companion = %config.companion_url,
        port = config.port,
        model = %config.model_name,
        tool_mode = config.tool_mode.as_str(),
        context_strategy = config.context_strategy.as_str(),
        "starting companion bridge"
    );

    bridge_server::serve(config).await
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_span_list(false),
                )
                .try_init()
                .ok();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_target(true))
                .try_init()
                .ok();
        }
    }
}
