//! Client side of a tunnel: the expose call, the control connection and
//! the reconnect loop around it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use portway_shared::channel::DEFAULT_CAPACITY;
use portway_shared::protocol::{ExposeRequest, ExposeResponse};
use portway_shared::{BinaryFrame, ControlMessage, ControlSender, Outbound, TunnelType};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http_client::HttpForwarder;
use crate::net_client::NetForwarder;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type ControlSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Expose failed: {0}")]
    Expose(String),

    #[error("Tunnel {0} is not registered on the relay")]
    UnknownTunnel(String),

    #[error("Control connection failed: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl SessionError {
    /// Errors a reconnect cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::UnknownTunnel(_) | SessionError::Expose(_))
    }
}

/// What to expose and where it lives locally
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub kind: TunnelType,
    pub local_host: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub desired_port: Option<u16>,
}

impl TunnelSpec {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Reserve a public endpoint on the relay
pub async fn expose(server: &str, spec: &TunnelSpec) -> Result<ExposeResponse, SessionError> {
    let url = format!("{}/api/expose/{}", server.trim_end_matches('/'), spec.kind);
    let body = ExposeRequest {
        host: spec.local_host.clone(),
        port: spec.local_port,
        desired_port: spec.desired_port,
        subdomain: spec.subdomain.clone(),
    };
    let response = reqwest::Client::new().post(&url).json(&body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(SessionError::Expose(format!("{} {}", status, detail.trim())));
    }
    Ok(response.json().await?)
}

/// WebSocket URL of a tunnel's control channel
pub fn control_url(server: &str, kind: TunnelType, tunnel_id: &str) -> String {
    let server = server.trim_end_matches('/');
    let base = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        server.to_string()
    };
    let path = match kind {
        TunnelType::Http => "tunnel",
        TunnelType::Tcp | TunnelType::Udp => "net-tunnel",
    };
    format!("{}/api/{}/{}", base, path, tunnel_id)
}

/// Local-side handler for one control connection
enum Forwarder {
    Http(Arc<HttpForwarder>),
    Net(Arc<NetForwarder>),
}

impl Forwarder {
    fn new(spec: &TunnelSpec, control: ControlSender) -> Self {
        match spec.kind {
            TunnelType::Http => Forwarder::Http(Arc::new(HttpForwarder::new(spec, control))),
            kind => Forwarder::Net(Arc::new(NetForwarder::new(kind, spec, control))),
        }
    }

    async fn on_message(&self, message: ControlMessage) {
        match self {
            Forwarder::Http(f) => f.on_message(message).await,
            Forwarder::Net(f) => f.on_message(message).await,
        }
    }

    async fn on_frame(&self, frame: BinaryFrame<'_>) {
        match self {
            Forwarder::Http(f) => f.on_frame(frame).await,
            Forwarder::Net(f) => f.on_frame(frame).await,
        }
    }

    fn shutdown(&self) {
        match self {
            Forwarder::Http(f) => f.shutdown(),
            Forwarder::Net(f) => f.shutdown(),
        }
    }
}

/// How a control session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Ctrl+C or the caller's cancellation
    Shutdown,
    /// The relay closed or dropped the connection
    Disconnected,
}

/// Run one control connection until it drops or `shutdown` fires
pub async fn run_session(
    url: &str,
    tunnel_id: &str,
    spec: &TunnelSpec,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, SessionError> {
    let socket = match connect_async(url).await {
        Ok((socket, _)) => socket,
        Err(tungstenite::Error::Http(response)) if response.status().as_u16() == 404 => {
            return Err(SessionError::UnknownTunnel(tunnel_id.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    debug!("Control connection established: {}", url);

    let (sender, rx) = ControlSender::channel(DEFAULT_CAPACITY);
    let forwarder = Forwarder::new(spec, sender.clone());
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx));

    let end = loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Shutdown,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => match ControlMessage::from_json(&text) {
                Ok(message) => forwarder.on_message(message).await,
                Err(e) => warn!("Dropping malformed control message: {}", e),
            },
            Some(Ok(Message::Binary(data))) => match BinaryFrame::decode(&data) {
                Ok(frame) => forwarder.on_frame(frame).await,
                Err(e) => warn!("Dropping malformed frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!("Relay closed the control connection: {:?}", frame);
                break SessionEnd::Disconnected;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Control connection error: {}", e);
                break SessionEnd::Disconnected;
            }
            None => break SessionEnd::Disconnected,
        }
    };

    forwarder.shutdown();
    if end == SessionEnd::Shutdown {
        sender.close().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    } else {
        writer.abort();
    }
    Ok(end)
}

/// The only task writing to the control socket
async fn write_loop(mut sink: SplitSink<ControlSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Binary(buf) => Message::Binary(buf.to_vec()),
            Outbound::Close => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutting down".into(),
                    })))
                    .await;
                return;
            }
        };
        if let Err(e) = sink.send(msg).await {
            debug!("control write failed: {}", e);
            return;
        }
    }
}

/// Expose `spec`, then keep its control connection up until `shutdown`.
/// Transient failures reconnect after a delay; an unknown tunnel id ends
/// the loop since the relay has discarded the reservation.
pub async fn run_tunnel(
    server: &str,
    spec: &TunnelSpec,
    shutdown: CancellationToken,
) -> Result<ExposeResponse, SessionError> {
    let exposed = expose(server, spec).await?;
    announce(spec, &exposed);
    let url = control_url(server, spec.kind, &exposed.tunnel_id);

    loop {
        match run_session(&url, &exposed.tunnel_id, spec, &shutdown).await {
            Ok(SessionEnd::Shutdown) => return Ok(exposed),
            Ok(SessionEnd::Disconnected) => {
                warn!("Control connection lost. Reconnecting in {:?}...", RECONNECT_DELAY)
            }
            Err(e) if e.is_fatal() => {
                error!("{}", e);
                return Err(e);
            }
            Err(e) => warn!("{}. Reconnecting in {:?}...", e, RECONNECT_DELAY),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(exposed),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

fn announce(spec: &TunnelSpec, exposed: &ExposeResponse) {
    let public = exposed.public_url.as_deref().unwrap_or("unknown");
    info!("Tunnel {} ready", exposed.tunnel_id);
    println!("\n  Portway {} tunnel active", spec.kind.as_str().to_uppercase());
    println!("  Public:  {}", public);
    println!("  Local:   {}\n", spec.local_addr());
}
