//! Telnet console server entry point.
//!
//! ```text
//! telcon-server                  Serve one session per configured address
//! telcon-server --config <path>  Load a custom config TOML
//! telcon-server --port <port>    Override the port of every listen address
//! telcon-server --gen-config     Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telcon_core::{Console, SinkRegistry, serve_once};
use telcon_server::commands::DeviceCommands;
use telcon_server::config::ServerConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "telcon-server", about = "Telnet command console with live log mirroring")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "telcon.toml")]
    config: PathBuf,

    /// TCP port for every listen address (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.override_port(port)?;
    }
    let addrs = config.listen_addrs()?;
    let session_config = config.to_session_config()?;

    // Init tracing. Every record goes through the sink registry so a
    // console session can mirror it.
    let sinks = SinkRegistry::default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sinks.clone())
        .with_ansi(false)
        .init();

    info!("telcon-server v{}", env!("CARGO_PKG_VERSION"));
    info!("max command length: {}", session_config.max_line_len);
    info!("restart after session: {}", config.network.restart);

    let handler = Arc::new(DeviceCommands::new(config.device.mac.clone()));
    let console = Console::new(session_config, sinks, handler);

    println!(
        "\nOpen a new terminal and use the following command to connect with the server: telnet <ip_address> {}\n",
        addrs[0].port()
    );

    let mut acceptors = JoinSet::new();
    for addr in addrs {
        acceptors.spawn(serve_address(addr, console.clone(), config.network.restart));
    }

    tokio::select! {
        _ = async { while acceptors.join_next().await.is_some() {} } => {
            info!("all acceptors finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            acceptors.shutdown().await;
        }
    }

    Ok(())
}

/// Serve sessions on one address: once, or over and over with `restart`.
/// A setup failure ends this address for good.
async fn serve_address(addr: SocketAddr, console: Console, restart: bool) {
    loop {
        match serve_once(addr, &console).await {
            Ok(report) => info!("session on {addr} finished: {:?}", report.end),
            Err(e) => {
                error!("telnet server on {addr} stopped: {e}");
                return;
            }
        }
        if !restart {
            return;
        }
    }
}
