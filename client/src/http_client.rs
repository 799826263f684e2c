//! Local side of an HTTP tunnel
//!
//! REQUEST messages become plain requests against the local service.
//! OPEN messages bridge a browser WebSocket onto a local WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use portway_shared::protocol::{sendable_close_code, CLOSE_INTERNAL_ERROR};
use portway_shared::{BinaryFrame, ConnectionTable, ControlMessage, ControlSender, HttpRequest, HttpResponse};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::TunnelSpec;

/// Frames queued toward one local socket, including those that arrive
/// while it is still connecting
const SOCKET_QUEUE: usize = 64;
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum LocalFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

struct LocalSocket {
    tx: mpsc::Sender<LocalFrame>,
    cancel: CancellationToken,
}

pub struct HttpForwarder {
    local_host: String,
    local_port: u16,
    http: reqwest::Client,
    control: ControlSender,
    sockets: Arc<ConnectionTable<LocalSocket>>,
}

impl HttpForwarder {
    pub fn new(spec: &TunnelSpec, control: ControlSender) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            local_host: spec.local_host.clone(),
            local_port: spec.local_port,
            http,
            control,
            sockets: Arc::new(ConnectionTable::new()),
        }
    }

    pub async fn on_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Request(request) => {
                let http = self.http.clone();
                let control = self.control.clone();
                let base = format!("http://{}:{}", self.local_host, self.local_port);
                tokio::spawn(async move {
                    let response = forward_local(&http, &base, request).await;
                    if let Err(e) = control.send_message(&ControlMessage::Response(response)).await {
                        debug!("response not delivered: {}", e);
                    }
                });
            }
            ControlMessage::Open {
                connection_id,
                path,
                query,
                headers,
            } => self.open_socket(connection_id, path, query, headers),
            ControlMessage::Text { connection_id, text } => {
                self.deliver(&connection_id, LocalFrame::Text(text)).await
            }
            ControlMessage::Binary { connection_id, data } => {
                self.deliver(&connection_id, LocalFrame::Binary(data)).await
            }
            ControlMessage::Close {
                connection_id,
                close_code,
                close_reason,
            } => {
                if let Some(socket) = self.sockets.remove(&connection_id) {
                    let frame = LocalFrame::Close(
                        sendable_close_code(close_code),
                        close_reason.unwrap_or_default(),
                    );
                    if socket.tx.try_send(frame).is_err() {
                        socket.cancel.cancel();
                    }
                }
            }
            other => debug!("Ignoring {} on http tunnel", other.kind()),
        }
    }

    pub async fn on_frame(&self, frame: BinaryFrame<'_>) {
        self.deliver(frame.connection_id, LocalFrame::Binary(frame.payload.to_vec()))
            .await;
    }

    async fn deliver(&self, connection_id: &str, frame: LocalFrame) {
        if let Some(socket) = self.sockets.get(connection_id) {
            let _ = socket.tx.send(frame).await;
        }
    }

    fn open_socket(
        &self,
        connection_id: String,
        path: Option<String>,
        query: Option<String>,
        headers: Vec<(String, String)>,
    ) {
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE);
        let cancel = CancellationToken::new();
        if !self.sockets.insert(connection_id.clone(), LocalSocket { tx, cancel: cancel.clone() }) {
            debug!("duplicate OPEN for {}", connection_id);
            return;
        }

        let mut url = format!(
            "ws://{}:{}{}",
            self.local_host,
            self.local_port,
            path.as_deref().unwrap_or("/")
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(&query);
        }

        let bridge = SocketBridge {
            connection_id,
            control: self.control.clone(),
            sockets: self.sockets.clone(),
        };
        tokio::spawn(bridge.run(url, headers, rx, cancel));
    }

    /// Close every local socket; the control connection is gone
    pub fn shutdown(&self) {
        for (_, socket) in self.sockets.drain() {
            socket.cancel.cancel();
        }
    }
}

/// Issue `request` against the local service. Failures become a 502.
pub async fn forward_local(http: &reqwest::Client, base: &str, request: HttpRequest) -> HttpResponse {
    let id = request.id.clone().unwrap_or_default();
    match try_forward(http, base, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Local request failed: {}", e);
            HttpResponse::bad_gateway(id, e)
        }
    }
}

async fn try_forward(
    http: &reqwest::Client,
    base: &str,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let mut url = format!("{}{}", base, request.path);
    if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    info!("{} {}", method, request.path);

    let mut builder = http.request(method, &url);
    for (name, value) in &request.headers {
        // the local service sees its own host
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response.bytes().await?;

    Ok(HttpResponse {
        id: request.id.unwrap_or_default(),
        status,
        headers,
        body: (!body.is_empty()).then(|| body.to_vec()),
    })
}

struct SocketBridge {
    connection_id: String,
    control: ControlSender,
    sockets: Arc<ConnectionTable<LocalSocket>>,
}

impl SocketBridge {
    async fn run(
        self,
        url: String,
        headers: Vec<(String, String)>,
        mut rx: mpsc::Receiver<LocalFrame>,
        cancel: CancellationToken,
    ) {
        let id = &self.connection_id;
        let connect = async {
            let mut request = url.as_str().into_client_request()?;
            for (name, value) in &headers {
                if name.eq_ignore_ascii_case("host") {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    request.headers_mut().append(name, value);
                }
            }
            connect_async(request).await.map(|(socket, _)| socket)
        };
        let socket = tokio::select! {
            _ = cancel.cancelled() => return,
            socket = connect => socket,
        };
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Local websocket {} failed: {}", url, e);
                self.finish(CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                return;
            }
        };
        if self.control.send_message(&ControlMessage::open_ok(id)).await.is_err() {
            return;
        }
        debug!("local websocket {} open for {}", url, id);

        let (mut sink, mut stream) = socket.split();
        let (code, reason) = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if self.control.send_message(&ControlMessage::text(id, text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if self.control.send_frame(id, &data).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break (CLOSE_INTERNAL_ERROR, e.to_string()),
                    None => break (1006, String::new()),
                },
                outgoing = rx.recv() => match outgoing {
                    Some(LocalFrame::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            break (CLOSE_INTERNAL_ERROR, e.to_string());
                        }
                    }
                    Some(LocalFrame::Binary(data)) => {
                        if let Err(e) = sink.send(Message::Binary(data)).await {
                            break (CLOSE_INTERNAL_ERROR, e.to_string());
                        }
                    }
                    Some(LocalFrame::Close(code, reason)) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        return;
                    }
                    None => return,
                },
            }
        };
        self.finish(code, &reason).await;
    }

    /// Report the local close upstream, unless the relay closed it first
    async fn finish(&self, code: u16, reason: &str) {
        if self.sockets.remove(&self.connection_id).is_some() {
            let _ = self
                .control
                .send_message(&ControlMessage::close_with(&self.connection_id, code, reason))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_service_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let http = reqwest::Client::new();
        let request = HttpRequest {
            id: Some("r1".into()),
            method: "GET".into(),
            path: "/health".into(),
            ..Default::default()
        };
        let response = forward_local(&http, &format!("http://127.0.0.1:{}", port), request).await;

        assert_eq!(response.id, "r1");
        assert_eq!(response.status, 502);
        let body = String::from_utf8(response.body.unwrap()).unwrap();
        assert!(body.starts_with("Bad Gateway: "));
    }
}
