//! Public traffic dispatch
//!
//! Requests whose `Host` is `<subdomain>.<domain>` belong to a tunnel and
//! never reach the relay's own routes. WebSocket upgrades are bridged;
//! everything else is relayed as one REQUEST/RESPONSE exchange.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum::extract::ws::WebSocketUpgrade;
use portway_shared::{Error, HttpRequest, HttpResponse};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge;
use crate::headers::extract_client_ip;
use crate::AppState;

/// Tunnel label of a public host, or `None` for the relay's own host
pub fn public_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host,
    };
    let label = host.strip_suffix(&domain.to_ascii_lowercase())?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

fn host_of(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host())
}

fn is_websocket_upgrade(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Middleware in front of every route
pub async fn dispatch(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let Some(subdomain) = host_of(&parts).and_then(|h| public_subdomain(h, &state.config.domain))
    else {
        return next.run(Request::from_parts(parts, body)).await;
    };

    let Some(tunnel) = state.registry.get_by_subdomain(&subdomain) else {
        debug!("No tunnel for {}", subdomain);
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    if is_websocket_upgrade(&parts) {
        if !tunnel.is_attached() {
            return bad_gateway("tunnel not connected");
        }
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => bridge::upgrade(ws, state.clone(), tunnel, &parts),
            Err(rejection) => rejection.into_response(),
        };
    }

    forward(&state, &subdomain, parts, body).await
}

async fn forward(state: &AppState, subdomain: &str, parts: Parts, body: Body) -> Response {
    let started = Instant::now();
    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Request body rejected: {}", e);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
    };

    let mut headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let host = host_of(&parts).unwrap_or_default().to_string();
    let client_ip = extract_client_ip(&headers, peer);
    state.headers.rewrite_request(&mut headers, client_ip, &host);

    let request = HttpRequest {
        id: None,
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(String::from),
        headers,
        body: (!body.is_empty()).then(|| body.to_vec()),
    };

    let (response, bytes_out) = match state.registry.forward_request(subdomain, request, None).await {
        Ok(response) => into_response(state, response),
        Err(Error::Timeout) => {
            warn!("Request to {} timed out", subdomain);
            ((StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response(), 0)
        }
        Err(Error::TunnelUnavailable | Error::ChannelClosed) => {
            (bad_gateway("tunnel not connected"), 0)
        }
        Err(e) => (bad_gateway(e), 0),
    };

    state
        .metrics
        .record_request(
            response.status().as_u16(),
            started.elapsed().as_micros() as u64,
            body.len() as u64,
            bytes_out,
        )
        .await;
    response
}

/// The relayed response and its body length
fn into_response(state: &AppState, response: HttpResponse) -> (Response, u64) {
    let mut headers = response.headers;
    state.headers.rewrite_response(&mut headers);

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                headers_mut.append(name, value);
            }
        }
    }
    let body = response.body.unwrap_or_default();
    let len = body.len() as u64;
    match builder.body(Body::from(body)) {
        Ok(r) => (r, len),
        Err(_) => ((StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(), 0),
    }
}

fn bad_gateway(detail: impl std::fmt::Display) -> Response {
    (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}", detail)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_subdomain() {
        let domain = "portway.dev";
        assert_eq!(public_subdomain("otter-4821.portway.dev", domain).as_deref(), Some("otter-4821"));
        assert_eq!(public_subdomain("Otter-4821.Portway.dev:443", domain).as_deref(), Some("otter-4821"));
        assert_eq!(public_subdomain("portway.dev", domain), None);
        assert_eq!(public_subdomain("a.b.portway.dev", domain), None);
        assert_eq!(public_subdomain("evilportway.dev", domain), None);
        assert_eq!(public_subdomain("otter.example.com", domain), None);
    }

    #[test]
    fn test_public_subdomain_on_localhost() {
        assert_eq!(public_subdomain("app.localhost:8080", "localhost").as_deref(), Some("app"));
        assert_eq!(public_subdomain("localhost:8080", "localhost"), None);
    }
}
