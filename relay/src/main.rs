use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use portway_relay::config::RelayConfig;
use portway_relay::threat::{ChainFilter, CidrFilter, IocThreatFilter};
use portway_relay::{serve, spawn_reaper, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portway_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env()?;

    let iocs = Arc::new(IocThreatFilter::new(&config.threat_iocs));
    let threats = ChainFilter::new()
        .with(Arc::new(CidrFilter::from_strings(&config.allow_cidrs, &config.deny_cidrs)))
        .with(iocs.clone());

    #[cfg(feature = "threatfox")]
    portway_relay::threat::spawn_refresh(iocs.clone(), config.threatfox.clone());
    #[cfg(not(feature = "threatfox"))]
    {
        if config.threatfox.auth_key.is_some() {
            tracing::warn!("THREATFOX_AUTH_KEY set but relay built without the threatfox feature");
        }
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        "Portway Relay on {} (domain: {}, {} static indicators)",
        addr,
        config.domain,
        iocs.len()
    );

    let state = AppState::new(config, Arc::new(threats));
    spawn_reaper(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;
    Ok(())
}
