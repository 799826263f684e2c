//! Multi-tunnel manager
//!
//! Runs every tunnel of a configuration file side by side, sharing one
//! shutdown token.

use crate::config::PortwayConfig;
use crate::session::run_tunnel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Manages multiple tunnel connections
pub struct TunnelManager {
    config: PortwayConfig,
    shutdown: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TunnelManager {
    pub fn new(config: PortwayConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Start all tunnels defined in the configuration
    pub fn start_all(&mut self) {
        println!("\n  Portway multi-tunnel mode: starting {} tunnel(s)\n", self.config.tunnels.len());

        for tunnel_conf in &self.config.tunnels {
            let server = self.config.server.clone();
            let spec = tunnel_conf.spec();
            let name = tunnel_conf.name.clone();
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                info!("Starting tunnel '{}' ({}) for {}", name, spec.kind, spec.local_addr());
                match run_tunnel(&server, &spec, shutdown).await {
                    Ok(exposed) => info!("Tunnel '{}' ({}) closed", name, exposed.tunnel_id),
                    Err(e) => error!("Tunnel '{}' stopped: {}", name, e),
                }
            });
            self.handles.push((tunnel_conf.name.clone(), handle));
        }
    }

    /// Wait until every tunnel has stopped
    pub async fn wait_for_shutdown(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("Tunnel '{}' task failed: {}", name, e);
            }
        }
        println!("\n  All tunnels stopped.");
    }
}
