//! Control channel endpoints
//!
//! A client dials `/api/tunnel/:tunnel_id` (HTTP tunnels) or
//! `/api/net-tunnel/:tunnel_id` (TCP/UDP tunnels) with the id it was issued
//! by the expose API. The socket is split: a writer task drains the
//! channel's queue, and the read loop here dispatches whatever the client
//! sends back.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use portway_shared::channel::DEFAULT_CAPACITY;
use portway_shared::protocol::{sendable_close_code, CLOSE_NORMAL};
use portway_shared::{BinaryFrame, ControlMessage, ControlSender, Outbound};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::ToBrowser;
use crate::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Target {
    Http(String),
    Net(String),
}

impl Target {
    fn tunnel_id(&self) -> &str {
        match self {
            Target::Http(id) | Target::Net(id) => id,
        }
    }
}

pub async fn http_control(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if state.registry.get_by_tunnel_id(&tunnel_id).is_none() {
        warn!("Control connection for unknown tunnel {}", tunnel_id);
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    }
    ws.on_upgrade(move |socket| run(socket, state, Target::Http(tunnel_id)))
}

pub async fn net_control(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if state.net.get(&tunnel_id).is_none() {
        warn!("Control connection for unknown tunnel {}", tunnel_id);
        return (StatusCode::NOT_FOUND, "Unknown tunnel").into_response();
    }
    ws.on_upgrade(move |socket| run(socket, state, Target::Net(tunnel_id)))
}

async fn run(socket: WebSocket, state: AppState, target: Target) {
    let (sender, rx) = ControlSender::channel(DEFAULT_CAPACITY);
    let attached = match &target {
        Target::Http(id) => state.registry.attach_control_channel(id, sender.clone()),
        Target::Net(id) => state.net.attach_control_channel(id, sender.clone()).await,
    };
    if !attached {
        // removed between the upgrade check and now
        let _ = socket.close().await;
        return;
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => on_text(&state, &target, &text).await,
            Ok(Message::Binary(data)) => on_frame(&state, &target, &data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("control socket for {} failed: {}", target.tunnel_id(), e);
                break;
            }
        }
    }

    match &target {
        Target::Http(_) => state.registry.detach_control_channel(&sender),
        Target::Net(_) => state.net.detach_control_channel(&sender).await,
    }
    writer.abort();
    info!("Control connection for {} ended", target.tunnel_id());
}

/// The only task writing to the control socket
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;
    loop {
        let msg = tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Text(text)) => Message::Text(text),
                Some(Outbound::Binary(buf)) => Message::Binary(buf.to_vec()),
                Some(Outbound::Close) | None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "tunnel closed".into(),
                        })))
                        .await;
                    return;
                }
            },
            _ = keepalive.tick() => Message::Ping(Vec::new()),
        };
        if let Err(e) = sink.send(msg).await {
            debug!("control write failed: {}", e);
            return;
        }
    }
}

async fn on_text(state: &AppState, target: &Target, text: &str) {
    let message = match ControlMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            state.metrics.malformed_message();
            warn!("Dropping malformed message on {}: {}", target.tunnel_id(), e);
            return;
        }
    };
    match target {
        Target::Http(id) => on_http_message(state, id, message).await,
        Target::Net(id) => on_net_message(state, id, message).await,
    }
}

async fn on_frame(state: &AppState, target: &Target, data: &[u8]) {
    let frame = match BinaryFrame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            state.metrics.malformed_message();
            warn!("Dropping malformed frame on {}: {}", target.tunnel_id(), e);
            return;
        }
    };
    match target {
        Target::Http(id) => {
            let Some(tunnel) = state.registry.get_by_tunnel_id(id) else {
                return;
            };
            if let Some(peer) = tunnel.browsers.get(frame.connection_id) {
                peer.send(ToBrowser::Binary(frame.payload.to_vec())).await;
            }
        }
        Target::Net(id) => {
            if let Some(tunnel) = state.net.get(id) {
                tunnel
                    .on_client_bytes(frame.connection_id, Bytes::copy_from_slice(frame.payload))
                    .await;
            }
        }
    }
}

async fn on_http_message(state: &AppState, tunnel_id: &str, message: ControlMessage) {
    let Some(tunnel) = state.registry.get_by_tunnel_id(tunnel_id) else {
        return;
    };
    match message {
        ControlMessage::Response(response) => {
            state.registry.on_response(tunnel_id, response);
        }
        ControlMessage::Text { connection_id, text } => {
            if let Some(peer) = tunnel.browsers.get(&connection_id) {
                peer.send(ToBrowser::Text(text)).await;
            }
        }
        ControlMessage::Binary { connection_id, data } => {
            if let Some(peer) = tunnel.browsers.get(&connection_id) {
                peer.send(ToBrowser::Binary(data)).await;
            }
        }
        ControlMessage::Close {
            connection_id,
            close_code,
            close_reason,
        } => {
            if let Some(peer) = tunnel.browsers.remove(&connection_id) {
                peer.close(
                    sendable_close_code(close_code),
                    close_reason.as_deref().unwrap_or(""),
                );
            }
        }
        ControlMessage::OpenOk { connection_id } => {
            debug!("local socket ready for {}", connection_id);
        }
        other => debug!("Ignoring {} from client on {}", other.kind(), tunnel_id),
    }
}

async fn on_net_message(state: &AppState, tunnel_id: &str, message: ControlMessage) {
    let Some(tunnel) = state.net.get(tunnel_id) else {
        return;
    };
    match message {
        ControlMessage::OpenOk { connection_id } => tunnel.on_open_ok(&connection_id).await,
        ControlMessage::Binary { connection_id, data } => {
            tunnel.on_client_bytes(&connection_id, Bytes::from(data)).await
        }
        ControlMessage::Text { connection_id, text } => {
            tunnel.on_client_bytes(&connection_id, Bytes::from(text)).await
        }
        ControlMessage::Close { connection_id, .. } => tunnel.on_client_close(&connection_id).await,
        other => debug!("Ignoring {} from client on {}", other.kind(), tunnel_id),
    }
}
