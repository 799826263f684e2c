//! Expose and admin API
//!
//! The expose calls reserve a public endpoint and hand back the tunnel id
//! the client must present when it dials its control channel.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use portway_shared::protocol::{ExposeRequest, ExposeResponse};
use portway_shared::{Error, TunnelType};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::metrics::TunnelGauges;
use crate::registry::TunnelSnapshot;
use crate::AppState;

/// Error body returned by the API
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::SubdomainTaken(_) => StatusCode::CONFLICT,
            Error::UnknownTunnel(_) => StatusCode::NOT_FOUND,
            Error::Protocol(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::ThreatBlocked(_) => StatusCode::FORBIDDEN,
            Error::TunnelUnavailable | Error::ChannelClosed => StatusCode::BAD_GATEWAY,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Io(_) | Error::PortUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// DNS label: lowercase letters, digits and inner hyphens
fn valid_subdomain(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn check_target(req: &ExposeRequest) -> Result<(), ApiError> {
    if req.host.trim().is_empty() || req.port == 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "host and port are required"));
    }
    Ok(())
}

pub async fn expose_http(
    State(state): State<AppState>,
    Json(req): Json<ExposeRequest>,
) -> Result<Json<ExposeResponse>, ApiError> {
    check_target(&req)?;
    let subdomain = req.subdomain.map(|s| s.trim().to_ascii_lowercase());
    if let Some(label) = &subdomain {
        if !valid_subdomain(label) {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, format!("invalid subdomain: {}", label)));
        }
    }

    let tunnel_id = Uuid::new_v4().to_string();
    let tunnel = state.registry.create_pending(subdomain, tunnel_id.clone())?;
    let public_url = state.config.public_url(&tunnel.subdomain);
    info!("Exposed {}:{} at {}", req.host, req.port, public_url);

    Ok(Json(ExposeResponse {
        tunnel_id,
        source: format!("{}:{}", req.host, req.port),
        public_url: Some(public_url),
        subdomain: Some(tunnel.subdomain.clone()),
        public_host: None,
        public_port: None,
    }))
}

pub async fn expose_tcp(
    State(state): State<AppState>,
    Json(req): Json<ExposeRequest>,
) -> Result<Json<ExposeResponse>, ApiError> {
    expose_net(state, req, TunnelType::Tcp).await
}

pub async fn expose_udp(
    State(state): State<AppState>,
    Json(req): Json<ExposeRequest>,
) -> Result<Json<ExposeResponse>, ApiError> {
    expose_net(state, req, TunnelType::Udp).await
}

async fn expose_net(
    state: AppState,
    req: ExposeRequest,
    kind: TunnelType,
) -> Result<Json<ExposeResponse>, ApiError> {
    check_target(&req)?;
    let tunnel_id = Uuid::new_v4().to_string();
    let exposed = state.net.expose(&tunnel_id, kind, req.desired_port).await?;
    let public_host = state.config.public_host.clone();
    info!("Exposed {}:{} at {}://{}:{}", req.host, req.port, kind, public_host, exposed.port);

    Ok(Json(ExposeResponse {
        tunnel_id,
        source: format!("{}:{}", req.host, req.port),
        public_url: Some(format!("{}://{}:{}", kind, public_host, exposed.port)),
        subdomain: None,
        public_host: Some(public_host),
        public_port: Some(exposed.port),
    }))
}

pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelSnapshot>> {
    let mut tunnels = state.registry.snapshots();
    tunnels.extend(state.net.snapshots());
    tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(tunnels)
}

pub async fn close_tunnel(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.remove_by_id(&tunnel_id).await || state.net.close_tunnel(&tunnel_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::UnknownTunnel(tunnel_id).into())
    }
}

pub async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not found")
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let gauges = TunnelGauges {
        http_tunnels: state.registry.len(),
        net_tunnels: state.net.len(),
        live_connections: state.net.live_connections()
            + state
                .registry
                .snapshots()
                .iter()
                .map(|t| t.connections)
                .sum::<usize>(),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(gauges).await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subdomain() {
        assert!(valid_subdomain("otter-4821"));
        assert!(valid_subdomain("app"));
        assert!(!valid_subdomain(""));
        assert!(!valid_subdomain("-app"));
        assert!(!valid_subdomain("my.app"));
        assert!(!valid_subdomain("My_App"));
    }

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = Error::SubdomainTaken("otter-1".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        let err: ApiError = Error::UnknownTunnel("x".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err: ApiError = Error::Timeout.into();
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
    }
}
