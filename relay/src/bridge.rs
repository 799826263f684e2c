//! Browser WebSocket bridge
//!
//! A WebSocket upgrade on a public host becomes one logical connection on
//! the tunnel's control channel. Browser frames are relayed as TEXT events
//! and binary frames; whatever the client sends back for the connection is
//! queued on the peer and written here.

use std::sync::Arc;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::{request::Parts, HeaderMap},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use portway_shared::ControlMessage;
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::{BrowserPeer, HttpTunnel, ToBrowser};
use crate::AppState;

/// Frames queued toward one browser
const BROWSER_QUEUE: usize = 64;
/// Reported when the browser vanished without a close frame
const CLOSE_ABNORMAL: u16 = 1006;
/// Reported when the browser's close frame carried no code
const CLOSE_NO_STATUS: u16 = 1005;

/// Handshake headers that belong to the public hop only
const HANDSHAKE_ONLY: &[&str] = &[
    "connection",
    "upgrade",
    "host",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
];

struct OpenRequest {
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
}

/// Requested sub-protocols, in the browser's order
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Complete the upgrade and bridge the socket through `tunnel`
pub fn upgrade(ws: WebSocketUpgrade, state: AppState, tunnel: Arc<HttpTunnel>, parts: &Parts) -> Response {
    let open = OpenRequest {
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(String::from),
        headers: parts
            .headers
            .iter()
            .filter(|(name, _)| !HANDSHAKE_ONLY.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    };
    // echo the browser's choice; the local service decides what it speaks
    ws.protocols(requested_protocols(&parts.headers))
        .on_upgrade(move |socket| run(socket, state, tunnel, open))
}

async fn run(socket: WebSocket, state: AppState, tunnel: Arc<HttpTunnel>, open: OpenRequest) {
    let Some(control) = tunnel.control() else {
        let _ = socket.close().await;
        return;
    };

    let (tx, mut rx) = mpsc::channel(BROWSER_QUEUE);
    let (id, _) = tunnel.browsers.open(BrowserPeer::new(tx, control.id()));
    let announce = ControlMessage::Open {
        connection_id: id.clone(),
        path: Some(open.path),
        query: open.query,
        headers: open.headers,
    };
    if control.send_message(&announce).await.is_err() {
        tunnel.browsers.remove(&id);
        let _ = socket.close().await;
        return;
    }
    state.metrics.connection_opened();
    debug!("[{}] browser socket {} opened", tunnel.subdomain, id);

    let (mut sink, mut stream) = socket.split();
    let mut observed_close = (CLOSE_ABNORMAL, String::new());

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.metrics.add_bytes_in(text.len() as u64);
                    if control.send_message(&ControlMessage::text(&id, text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    state.metrics.add_bytes_in(data.len() as u64);
                    if control.send_frame(&id, &data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    observed_close = match frame {
                        Some(frame) => (frame.code, frame.reason.into_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            outgoing = rx.recv() => match outgoing {
                Some(ToBrowser::Text(text)) => {
                    state.metrics.add_bytes_out(text.len() as u64);
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(ToBrowser::Binary(data)) => {
                    state.metrics.add_bytes_out(data.len() as u64);
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(ToBrowser::Close(code, reason)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
                None => break,
            },
        }
    }

    // whoever removes the peer reports the close; a client-initiated close
    // already removed it
    if tunnel.browsers.remove(&id).is_some() {
        let (code, reason) = observed_close;
        let _ = control
            .send_message(&ControlMessage::close_with(&id, code, reason))
            .await;
    }
    debug!("[{}] browser socket {} closed", tunnel.subdomain, id);
}
