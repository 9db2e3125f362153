use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use clarvis::config::{DEFAULT_CONFIG_FILE, FileConfig, Overrides, ProxyConfig, load_config};
use clarvis::{AppState, router};

#[derive(Parser)]
#[command(name = "clarvis")]
#[command(about = "Same-origin proxy and directory browser for the Clarvis web chat")]
struct Cli {
    /// Config file (defaults to ./clarvis.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "clarvis=debug,tower_http=debug,info"
    } else {
        "clarvis=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_file = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file_config: FileConfig = load_config(&config_file)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_file.display()))?;
    let config = ProxyConfig::from_file(
        &file_config,
        &Overrides {
            host: cli.host,
            port: cli.port,
        },
    )?;

    let state = AppState::new(config.clone()).context("Failed to build HTTP client")?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let actual_addr = listener.local_addr()?;

    info!("Clarvis listening on http://{}", actual_addr);
    info!("Backend: {}", config.backend);
    for root in &config.allowed_roots {
        info!("Browse root: {}", root.display());
    }
    match &config.static_dir {
        Some(dir) => info!("Serving UI from {}", dir.display()),
        None => info!("No static dir configured; only /api and /ws are served"),
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
