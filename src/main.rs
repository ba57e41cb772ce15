//! TLS Edge Proxy
//!
//! Terminates TLS on the public port and relays HTTP/1.1 and upgraded
//! (WebSocket) traffic to a single plaintext upstream.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────┐
//!                     │                  TLS EDGE PROXY                  │
//!                     │                                                  │
//!   Client (TLS)      │  ┌──────────┐   ┌──────────┐   ┌─────────────┐   │
//!   ──────────────────┼─▶│   net    │──▶│   http   │──▶│  upstream   │───┼──▶ node:9944
//!                     │  │ listener │   │ session  │   │ connection  │   │    (plaintext)
//!                     │  │ + tls    │   │  + fsm   │   └─────────────┘   │
//!                     │  └──────────┘   └────┬─────┘                     │
//!                     │                      │ 101                       │
//!                     │                      ▼                           │
//!                     │               ┌─────────────┐                    │
//!                     │               │   tunnel    │ raw bytes, both ways
//!                     │               └─────────────┘                    │
//!                     │                                                  │
//!                     │  config · observability · lifecycle              │
//!                     └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use tls_edge_proxy::config::load_config;
use tls_edge_proxy::lifecycle::{self, signals, Shutdown, StartupError};
use tls_edge_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "tls-edge-proxy")]
#[command(about = "TLS-terminating reverse proxy for a single upstream", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tls-edge-proxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            eprintln!("tls-edge-proxy: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        "tls-edge-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = lifecycle::start(&config).await?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(signals::shutdown_on_signal(shutdown));

    server.run(receiver).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
