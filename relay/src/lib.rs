//! Portway Relay
//!
//! Public-facing broker: accepts expose calls, holds one control channel
//! per tunnel and multiplexes public HTTP, WebSocket, TCP and UDP traffic
//! over it.

pub mod api;
pub mod bridge;
pub mod config;
pub mod control;
pub mod correlator;
pub mod headers;
pub mod metrics;
pub mod net;
pub mod proxy;
pub mod registry;
pub mod threat;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use config::RelayConfig;
use headers::HeaderRewriter;
use metrics::Metrics;
use net::NetTunnelRegistry;
use registry::TunnelRegistry;
use threat::ThreatFilter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<TunnelRegistry>,
    pub net: Arc<NetTunnelRegistry>,
    pub metrics: Metrics,
    pub headers: Arc<HeaderRewriter>,
}

impl AppState {
    pub fn new(config: RelayConfig, threats: Arc<dyn ThreatFilter>) -> Self {
        let metrics = Metrics::new();
        Self {
            registry: Arc::new(TunnelRegistry::new(config.request_timeout)),
            net: Arc::new(NetTunnelRegistry::new(config.bind_ip, threats, metrics.clone())),
            headers: Arc::new(HeaderRewriter::new(config.public_scheme.clone())),
            metrics,
            config: Arc::new(config),
        }
    }
}

/// All relay routes, with public-host dispatch in front of them
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/expose/http", post(api::expose_http))
        .route("/api/expose/tcp", post(api::expose_tcp))
        .route("/api/expose/udp", post(api::expose_udp))
        .route("/api/tunnels", get(api::list_tunnels))
        .route("/api/tunnels/:tunnel_id", delete(api::close_tunnel))
        .route("/api/tunnel/:tunnel_id", get(control::http_control))
        .route("/api/net-tunnel/:tunnel_id", get(control::net_control))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .fallback(api::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), proxy::dispatch))
        .with_state(state)
}

/// Periodically drop tunnels whose client has not come back
pub fn spawn_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let grace = state.config.grace_period;
        let mut ticker = tokio::time::interval((grace / 4).max(std::time::Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let http = state.registry.reap_idle(grace).await;
            let net = state.net.reap_idle(grace).await;
            if !http.is_empty() || !net.is_empty() {
                info!("Reaped {} idle tunnels", http.len() + net.len());
            }
        }
    })
}

/// Serve the relay on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}
