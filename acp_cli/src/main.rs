mod server;

use acp_core::{AgentConfig, Dispatcher};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "acp-agent.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Agent Control Protocol agent", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Address to listen on (overrides `[server] host`).
    #[clap(long)]
    host: Option<String>,
    #[clap(short, long)]
    port: Option<u16>,
    /// Tracing filter directives, used when `RUST_LOG` is not set.
    #[clap(long)]
    log_filter: Option<String>,
}

/// Returns the configuration and a description of where it came from.
fn load_config(cli: &Cli) -> Result<(AgentConfig, String), anyhow::Error> {
    let (mut config, source) = match &cli.config_file {
        Some(path) => (
            AgentConfig::load_from_file(path)?,
            format!("{}", path.display()),
        ),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                (
                    AgentConfig::load_from_file(&default_path)?,
                    DEFAULT_CONFIG_FILE.to_string(),
                )
            } else {
                (AgentConfig::default(), "built-in defaults".to_string())
            }
        }
    };

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(filter) = &cli.log_filter {
        config.logging.filter = filter.clone();
    }
    Ok((config, source))
}

fn init_tracing(fallback_filter: &str) -> Result<(), anyhow::Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback_filter)
            .map_err(|e| anyhow::anyhow!("Invalid log filter '{fallback_filter}': {e}"))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let (config, source) = load_config(&cli)?;
    init_tracing(&config.logging.filter)?;
    info!(source = %source, "Configuration loaded");

    let dispatcher = Arc::new(Dispatcher::new(config.session.clone()));
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {address}: {e}"))?;
    info!(
        address = %address,
        default_publisher = %config.session.default_publisher,
        "Agent listening"
    );

    server::serve(listener, dispatcher).await
}
