//! wa-gateway: multi-tenant messaging gateway
//!
//! Usage:
//!   wa-gateway                   - Start the HTTP API
//!   wa-gateway --config <path>   - Start with an explicit config file
//!   wa-gateway --help            - Show help

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use wa_api::AppState;
use wa_bridge::BridgeTransportFactory;
use wa_core::{Config, CredentialStore, SessionRegistry, SessionSettings, WebhookDispatcher};

/// Run mode
#[derive(Debug, PartialEq)]
enum RunMode {
    /// Serve the HTTP API
    Server { config: Option<PathBuf> },
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args(std::env::args().skip(1))?;

    let config_path = match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("wa-gateway {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Server { config } => config,
    };

    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    let config = Config::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log.level))?,
        )
        .init();

    tracing::info!("Starting wa-gateway...");
    run_server(config).await
}

/// Parse command line arguments
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<RunMode> {
    let mut config = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-v" => return Ok(RunMode::Version),
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    Ok(RunMode::Server { config })
}

/// Print help message
fn print_help() {
    println!("wa-gateway - Multi-tenant messaging gateway");
    println!();
    println!("Usage:");
    println!("  wa-gateway                  Start the HTTP API");
    println!("  wa-gateway --config <path>  Use an explicit config file");
    println!("  wa-gateway --help           Show this help message");
    println!("  wa-gateway --version        Show version");
    println!();
    println!("Environment Variables:");
    println!("  WA_GATEWAY_CONFIG       Config file (default: ./wa-gateway.toml)");
    println!("  API_KEY                 Shared secret for protected endpoints");
    println!("  HOST / PORT             Bind address (default: 0.0.0.0:3000)");
    println!("  WEBHOOK_URL             Receiver for lifecycle and message events");
    println!("  AUTH_DIR                Credential directory (default: data/auth)");
    println!("  DEFAULT_SESSION_ID      Session used when a request names none");
    println!("  MAX_RECONNECT_ATTEMPTS  Automatic reconnect limit (default: 3)");
    println!("  CREATE_WAIT_MS          How long create-session waits for a QR");
    println!("  RESTORE_SESSIONS        Reconnect stored sessions on startup (default: true)");
    println!("  BRIDGE_URL              Protocol bridge WebSocket URL");
    println!("  LOG_LEVEL               Log filter when RUST_LOG is unset (default: info)");
}

/// Wire the registry to the bridge and serve until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    if config.api.key.is_none() {
        tracing::warn!("API_KEY is not set; protected endpoints are open");
    }

    let dispatcher = WebhookDispatcher::new(&config.webhook)
        .map_err(|e| anyhow::anyhow!("Failed to create webhook dispatcher: {}", e))?;
    match &config.webhook.url {
        Some(url) => tracing::info!("Webhook events go to {}", url),
        None => tracing::info!("Webhook delivery disabled (no WEBHOOK_URL)"),
    }

    let factory = BridgeTransportFactory::new(&config.bridge)
        .map_err(|e| anyhow::anyhow!("Invalid bridge configuration: {}", e))?;
    tracing::info!("Protocol bridge: {}", config.bridge.url);

    let credentials = CredentialStore::new(config.sessions.auth_dir.clone());
    let registry = SessionRegistry::new(
        Arc::new(factory),
        credentials,
        dispatcher,
        SessionSettings::from(&config.sessions),
    );

    if config.sessions.restore_on_startup {
        if let Err(e) = registry.restore().await {
            tracing::warn!("Session restore failed: {}", e);
        }
    } else {
        tracing::info!("Session restore disabled");
    }

    let state = AppState::new(config, Arc::clone(&registry));

    tracing::info!("wa-gateway initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    let result = wa_api::start_server(state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Shutting down...");
    })
    .await;

    registry.shutdown().await;
    tracing::info!("Shutdown complete");
    result
}
