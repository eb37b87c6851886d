//! Inspector - proxy server between the inspector UI and protocol servers.
//!
//! This is the main entry point for the inspector CLI.

mod logging;

use clap::{Parser, Subcommand};
use inspector_server::{create_router, AppState, InspectorConfig};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How many consecutive ports to try when the configured one is taken.
const PORT_ATTEMPTS: u16 = 10;

#[derive(Parser)]
#[command(name = "inspector")]
#[command(author, version, about = "Proxy server for inspecting protocol servers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file, applied after the global and project files
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Port to listen on; no fallback to other ports when given
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Write logs to a file instead of stdout
        #[arg(long)]
        log_file: bool,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        host: None,
        log_file: false,
    }) {
        Commands::Serve {
            port,
            host,
            log_file,
        } => {
            if let Some(path) = logging::init(cli.verbose, log_file) {
                eprintln!("Logging to {}", path.display());
            }
            run_server(&cwd, cli.config.as_deref(), port, host).await
        }
        Commands::Config => show_config(&cwd, cli.config.as_deref()).await,
    }
}

/// Run the HTTP server until Ctrl-C.
async fn run_server(
    cwd: &Path,
    config_path: Option<&Path>,
    port: Option<u16>,
    host: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, sources) = InspectorConfig::load(Some(cwd), config_path).await?;
    for source in &sources {
        info!(path = %source.display(), "Loaded configuration");
    }

    let explicit_port = port.is_some();
    if port.is_some() {
        config.port = port;
    }
    if host.is_some() {
        config.host = host;
    }
    config.validate()?;

    let host = config.host().to_string();
    let attempts = if explicit_port { 1 } else { PORT_ATTEMPTS };
    let listener = bind_with_fallback(&host, config.port(), attempts).await?;
    let address = listener.local_addr()?;

    let state = AppState::new(config)?;
    state.set_port(address.port());
    let app = create_router(state.clone());

    info!(
        max_sessions = state.config.max_sessions(),
        "Proxy server listening on http://{}", address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutting down");
            // Closing the sessions ends their streams so the server can drain.
            let closed = state.proxy.close_all_connections().await;
            info!(closed, "Closed all sessions");
        })
        .await?;

    Ok(())
}

/// Bind `host:port`, moving on to the next port while the address is in use.
async fn bind_with_fallback(host: &str, port: u16, attempts: u16) -> std::io::Result<TcpListener> {
    let mut candidate = port;
    let mut attempt = 1;
    loop {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!(requested = port, port = candidate, "Port in use, using another");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                let Some(next) = candidate.checked_add(1) else {
                    return Err(e);
                };
                candidate = next;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Show the effective configuration and where it came from.
async fn show_config(cwd: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let (config, sources) = InspectorConfig::load(Some(cwd), config_path).await?;

    println!("Configuration sources:");
    if sources.is_empty() {
        println!("  (none)");
    } else {
        for source in &sources {
            println!("  {}", source.display());
        }
    }
    println!();

    println!("Current configuration:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
