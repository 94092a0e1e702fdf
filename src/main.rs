//! portfwd CLI - forward TCP ports and unix sockets over one session

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portfwd_session::SessionConfig;

/// portfwd - Forward ports and unix sockets through a single connection
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "Forward ports and unix sockets through a single connection", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML config file; command-line flags override its values
    #[arg(short, long, global = true, env = "PORTFWD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept sessions and answer their forwarding requests
    Serve {
        /// Address to accept sessions on
        #[arg(long, env = "PORTFWD_LISTEN")]
        listen: Option<String>,

        /// Close accepted connections whose destination never answers (seconds)
        #[arg(long)]
        pending_timeout: Option<u64>,
    },

    /// Connect to a server and forward the given tunnels
    #[command(long_about = r#"
Connect to a portfwd server and forward tunnels through the session.

TUNNEL FORMS:
  8080:80                      listen on localhost:8080, connect to port 80
  8000-8010:9000-9010          equal-length port ranges
  127.0.0.1:5432:db:5432       ssh-style host:port:host:port
  [::1]:8888:[::1]:9999        IPv6 hosts in square brackets
  SSH_AUTH_SOCK:/path/to/sock  unix socket forward exposed as a variable

EXAMPLES:
  # Reach the server's port 80 on local port 8080
  portfwd connect --server relay.example.com:2022 -t 8080:80

  # Expose local port 22 as port 2222 on the server
  portfwd connect --server relay.example.com:2022 -r 2222:22
    "#)]
    Connect {
        /// Server address (e.g., relay.example.com:2022)
        #[arg(long, env = "PORTFWD_SERVER")]
        server: Option<String>,

        /// Forward tunnel: listen locally, connect on the server
        #[arg(short = 't', long = "tunnel")]
        tunnels: Vec<String>,

        /// Reverse tunnel: listen on the server, connect locally
        #[arg(short = 'r', long = "reverse-tunnel")]
        reverse_tunnels: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    init_logging(log_level)?;

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            listen,
            pending_timeout,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if pending_timeout.is_some() {
                config.handler.pending_timeout_seconds = pending_timeout;
            }
            config.validate().context("Invalid configuration")?;

            portfwd_session::bind_and_serve(config, shutdown_signal())
                .await
                .context("Server failed")?;
        }
        Commands::Connect {
            server,
            tunnels,
            reverse_tunnels,
        } => {
            if server.is_some() {
                config.server = server;
            }
            config.tunnels.extend(tunnels);
            config.reverse_tunnels.extend(reverse_tunnels);
            config.validate().context("Invalid configuration")?;

            portfwd_session::connect(&config, shutdown_signal())
                .await
                .context("Session failed")?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("Received Ctrl+C, shutting down gracefully...");
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
