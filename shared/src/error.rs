//! Error types for Portway.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Tunnel not connected")]
    TunnelUnavailable,

    #[error("Timeout")]
    Timeout,

    #[error("Blocked by threat filter: {0}")]
    ThreatBlocked(String),

    #[error("Port {0} unavailable")]
    PortUnavailable(u16),

    #[error("Subdomain {0} is already reserved")]
    SubdomainTaken(String),

    #[error("Unknown tunnel {0}")]
    UnknownTunnel(String),
}
