//! Configuration file parser for Portway
//!
//! Supports portway.yml with multi-tunnel definitions.

use anyhow::{Context, Result};
use portway_shared::TunnelType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::TunnelSpec;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortwayConfig {
    /// Relay server base URL
    #[serde(default = "default_server")]
    pub server: String,

    /// Tunnel definitions
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Single tunnel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Human-readable name
    pub name: String,

    /// Protocol: http, tcp, or udp
    #[serde(default = "default_proto")]
    pub proto: TunnelType,

    /// Local port to forward traffic to
    pub local_port: u16,

    /// Local hostname to forward to (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Optional custom subdomain (HTTP only)
    pub subdomain: Option<String>,

    /// Preferred public port (TCP/UDP only)
    pub desired_port: Option<u16>,
}

impl TunnelConfig {
    pub fn spec(&self) -> TunnelSpec {
        TunnelSpec {
            kind: self.proto,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            subdomain: self.subdomain.clone(),
            desired_port: self.desired_port,
        }
    }
}

pub fn default_server() -> String {
    "http://localhost:8080".to_string()
}

fn default_proto() -> TunnelType {
    TunnelType::Http
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl PortwayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: PortwayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            anyhow::bail!("No tunnels defined in configuration");
        }

        for tunnel in &self.tunnels {
            if tunnel.name.is_empty() {
                anyhow::bail!("Tunnel name cannot be empty");
            }
            if tunnel.local_port == 0 {
                anyhow::bail!("Invalid port 0 for tunnel '{}'", tunnel.name);
            }
            if tunnel.subdomain.is_some() && tunnel.proto != TunnelType::Http {
                anyhow::bail!("Tunnel '{}': subdomain only applies to http tunnels", tunnel.name);
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["portway.yml", "portway.yaml", ".portway.yml", ".portway.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        let home = dirs::home_dir()?;
        candidates
            .iter()
            .map(|name| home.join(name))
            .find(|path| path.exists())
    }
}
