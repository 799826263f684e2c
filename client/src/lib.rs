//! Portway client
//!
//! Exposes local HTTP, TCP and UDP services through a Portway relay.

pub mod config;
pub mod http_client;
pub mod multi;
pub mod net_client;
pub mod session;

pub use config::{PortwayConfig, TunnelConfig};
pub use session::{run_tunnel, SessionError, TunnelSpec};
