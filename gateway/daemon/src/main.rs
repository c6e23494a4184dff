//! Gateway Daemon - HTTP/SSE Chat Gateway
//!
//! Hosts the gateway core behind a small HTTP API. Replies stream to clients
//! as server-sent events.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Ollama on localhost:11434, listen on 127.0.0.1:8080)
//! gateway-daemon
//!
//! # Use an OpenAI-compatible vendor
//! OPENAI_API_KEY=... gateway-daemon --provider openai \
//!     --endpoint https://api.openai.com/v1 --model gpt-4o-mini
//!
//! # With config file
//! gateway-daemon --config /etc/chat-gateway/gateway.toml
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use gateway_core::retrieval::InMemoryChunkStore;
use gateway_core::{
    load_config_from_path, ChatGateway, ConfigOverrides, GatewayConfig, HttpConnector,
    InMemoryStore, ProviderKind, RetrievalInjector,
};

/// Gateway Daemon - provider-agnostic streaming chat over HTTP/SSE
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Vendor family (ollama, openai, anthropic)
    #[arg(long, value_name = "KIND")]
    provider: Option<ProviderKind>,

    /// Vendor base URL
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// Model identifier
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// Listen host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(kind) = self.provider {
            overrides = overrides.with_provider(kind);
        }
        if let Some(endpoint) = &self.endpoint {
            overrides = overrides.with_endpoint(endpoint.clone());
        }
        if let Some(model) = &self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(host) = &self.host {
            overrides = overrides.with_host(host.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// `RUST_LOG` wins when set.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(format!(
            "gateway_daemon={level},gateway_core={level}"
        ))
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

/// Load the file/env configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let path = args.config.clone().or_else(gateway_core::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Wire the core collaborators from configuration
fn build_gateway(config: &GatewayConfig) -> ChatGateway {
    let connector = HttpConnector::with_connect_timeout(config.connect_timeout);
    let retrieval = RetrievalInjector::from_config(
        &config.retrieval,
        connector.client(),
        Arc::new(InMemoryChunkStore::new()),
    );

    ChatGateway::new(Arc::new(InMemoryStore::new()), Arc::new(connector))
        .with_retrieval(retrieval)
        .with_session_config(config.session.clone())
        .with_dispatcher_config(config.dispatcher.clone())
        .with_default_provider(config.provider.clone())
}

/// Resolves when SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let config = resolve_config(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source(),
        provider = %config.provider.kind,
        endpoint = %config.provider.endpoint,
        model = %config.provider.model,
        "Gateway daemon starting"
    );
    if let Some(path) = &config.config_file_path {
        info!(path = ?path, "Loaded config file");
    }

    let gateway = Arc::new(build_gateway(&config));

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {address}"))?;

    server::serve(Arc::clone(&gateway), listener, shutdown_signal()).await?;

    let in_flight = gateway.active_generations();
    if in_flight > 0 {
        warn!(in_flight, "Shutting down with generations still in flight");
    }
    info!("Gateway daemon stopped");
    Ok(())
}
