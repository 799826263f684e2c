use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portway::config::{default_server, PortwayConfig};
use portway::multi::TunnelManager;
use portway::{run_tunnel, TunnelSpec};
use portway_shared::TunnelType;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portway")]
#[command(version)]
#[command(about = "Expose local HTTP, TCP and UDP services through a Portway relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay server URL
    #[arg(short, long, env = "PORTWAY_SERVER", default_value_t = default_server())]
    server: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Custom subdomain
        #[arg(short = 'd', long)]
        subdomain: Option<String>,
    },
    /// Expose TCP service
    Tcp {
        /// Local port to expose
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Preferred public port
        #[arg(short = 'p', long)]
        desired_port: Option<u16>,
    },
    /// Expose UDP service
    Udp {
        /// Local port to expose
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Preferred public port
        #[arg(short = 'p', long)]
        desired_port: Option<u16>,
    },
    /// Start every tunnel in a portway.yml
    Up {
        /// Config file (default: portway.yml in the working or home directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "portway=debug" } else { "portway=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                shutdown.cancel();
            }
        });
    }

    let spec = match cli.command {
        Commands::Http {
            port,
            host,
            subdomain,
        } => TunnelSpec {
            kind: TunnelType::Http,
            local_host: host,
            local_port: port,
            subdomain,
            desired_port: None,
        },
        Commands::Tcp {
            port,
            host,
            desired_port,
        } => net_spec(TunnelType::Tcp, host, port, desired_port),
        Commands::Udp {
            port,
            host,
            desired_port,
        } => net_spec(TunnelType::Udp, host, port, desired_port),
        Commands::Up { config } => {
            let path = config
                .or_else(PortwayConfig::find_config)
                .context("No portway.yml found; pass --config")?;
            let config = PortwayConfig::load(&path)?;
            info!("Loaded {} tunnel(s) from {}", config.tunnels.len(), path.display());

            let mut manager = TunnelManager::new(config, shutdown);
            manager.start_all();
            manager.wait_for_shutdown().await;
            return Ok(());
        }
    };

    info!("Connecting to relay: {}", cli.server);
    println!("Press Ctrl+C to stop the tunnel");
    run_tunnel(&cli.server, &spec, shutdown)
        .await
        .with_context(|| format!("{} tunnel to {} failed", spec.kind, spec.local_addr()))?;
    Ok(())
}

fn net_spec(kind: TunnelType, host: String, port: u16, desired_port: Option<u16>) -> TunnelSpec {
    TunnelSpec {
        kind,
        local_host: host,
        local_port: port,
        subdomain: None,
        desired_port,
    }
}
