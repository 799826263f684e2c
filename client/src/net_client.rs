//! Local side of TCP and UDP tunnels
//!
//! TCP: each OPEN dials the local target, answers OPEN_OK and starts a
//! read pump; bytes from the relay are written by one writer task per
//! connection. UDP: each flow id gets its own local socket so replies can
//! be routed back to the public peer that sent the datagram.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portway_shared::{BinaryFrame, ConnectionTable, ControlMessage, ControlSender, TunnelType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::TunnelSpec;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const READ_BUF_SIZE: usize = 16 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;
const WRITE_QUEUE: usize = 64;

/// A dialed (or dialing) local TCP connection
struct LocalStream {
    writer: mpsc::Sender<Bytes>,
    /// Aborts the dial and stops the read pump
    cancel: CancellationToken,
}

/// A UDP flow's local socket
struct LocalFlow {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

struct Shared {
    local_addr: String,
    control: ControlSender,
    streams: ConnectionTable<LocalStream>,
    flows: ConnectionTable<LocalFlow>,
    idle_timeout: Duration,
}

impl Shared {
    /// Local side ended; tell the relay unless it closed first
    async fn finish(&self, connection_id: &str, reason: Option<String>) {
        let Some(stream) = self.streams.remove(connection_id) else {
            return;
        };
        stream.cancel.cancel();
        let close = match reason {
            Some(reason) => ControlMessage::Close {
                connection_id: connection_id.to_string(),
                close_code: None,
                close_reason: Some(reason),
            },
            None => ControlMessage::close(connection_id),
        };
        let _ = self.control.send_message(&close).await;
        debug!("closed {}", connection_id);
    }

    async fn finish_flow(&self, flow_id: &str) {
        if let Some(flow) = self.flows.remove(flow_id) {
            flow.cancel.cancel();
            let _ = self.control.send_message(&ControlMessage::close(flow_id)).await;
            debug!("udp flow {} expired", flow_id);
        }
    }
}

pub struct NetForwarder {
    kind: TunnelType,
    shared: Arc<Shared>,
}

impl NetForwarder {
    pub fn new(kind: TunnelType, spec: &TunnelSpec, control: ControlSender) -> Self {
        Self::with_idle_timeout(kind, spec, control, UDP_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        kind: TunnelType,
        spec: &TunnelSpec,
        control: ControlSender,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                local_addr: spec.local_addr(),
                control,
                streams: ConnectionTable::new(),
                flows: ConnectionTable::new(),
                idle_timeout,
            }),
        }
    }

    pub async fn on_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Open { connection_id, .. } if self.kind == TunnelType::Tcp => {
                self.open_stream(connection_id)
            }
            ControlMessage::Binary { connection_id, data } => {
                self.on_bytes(&connection_id, Bytes::from(data)).await
            }
            ControlMessage::Text { connection_id, text } => {
                self.on_bytes(&connection_id, Bytes::from(text)).await
            }
            ControlMessage::Close { connection_id, .. } => self.on_close(&connection_id),
            other => debug!("Ignoring {} on {} tunnel", other.kind(), self.kind),
        }
    }

    pub async fn on_frame(&self, frame: BinaryFrame<'_>) {
        self.on_bytes(frame.connection_id, Bytes::copy_from_slice(frame.payload))
            .await;
    }

    async fn on_bytes(&self, connection_id: &str, data: Bytes) {
        match self.kind {
            TunnelType::Udp => self.send_datagram(connection_id, data).await,
            _ => {
                if let Some(stream) = self.shared.streams.get(connection_id) {
                    let _ = stream.writer.send(data).await;
                }
            }
        }
    }

    /// CLOSE from the relay. Unknown ids are ignored.
    fn on_close(&self, connection_id: &str) {
        match self.kind {
            TunnelType::Udp => {
                if let Some(flow) = self.shared.flows.remove(connection_id) {
                    flow.cancel.cancel();
                }
            }
            _ => {
                if let Some(stream) = self.shared.streams.remove(connection_id) {
                    stream.cancel.cancel();
                }
            }
        }
    }

    fn open_stream(&self, connection_id: String) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let cancel = CancellationToken::new();
        let entry = LocalStream {
            writer: tx,
            cancel: cancel.clone(),
        };
        if !self.shared.streams.insert(connection_id.clone(), entry) {
            debug!("duplicate OPEN for {}", connection_id);
            return;
        }
        tokio::spawn(dial(self.shared.clone(), connection_id, rx, cancel));
    }

    async fn send_datagram(&self, flow_id: &str, data: Bytes) {
        let flow = match self.shared.flows.get(flow_id) {
            Some(flow) => flow,
            None => match self.open_flow(flow_id).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("udp flow {} to {} failed: {}", flow_id, self.shared.local_addr, e);
                    let _ = self
                        .shared
                        .control
                        .send_message(&ControlMessage::close(flow_id))
                        .await;
                    return;
                }
            },
        };
        if let Err(e) = flow.socket.send(&data).await {
            debug!("udp send for {} failed: {}", flow_id, e);
        }
    }

    async fn open_flow(&self, flow_id: &str) -> std::io::Result<Arc<LocalFlow>> {
        let target = tokio::net::lookup_host(&self.shared.local_addr)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;

        let cancel = CancellationToken::new();
        let (flow, created) = self.shared.flows.insert_or_get(flow_id, || LocalFlow {
            socket: Arc::new(socket),
            cancel: cancel.clone(),
        });
        if created {
            debug!("udp flow {} -> {}", flow_id, target);
            tokio::spawn(udp_replies(
                self.shared.clone(),
                flow_id.to_string(),
                flow.socket.clone(),
                cancel,
            ));
        }
        Ok(flow)
    }

    /// Close everything local; the control connection is gone
    pub fn shutdown(&self) {
        for (_, stream) in self.shared.streams.drain() {
            stream.cancel.cancel();
        }
        for (_, flow) in self.shared.flows.drain() {
            flow.cancel.cancel();
        }
    }
}

/// Dial the local target, acknowledge, then pump both directions
async fn dial(
    shared: Arc<Shared>,
    connection_id: String,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let connect = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&shared.local_addr));
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect => result,
    };
    let stream = match stream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Dial {} failed: {}", shared.local_addr, e);
            shared.finish(&connection_id, Some(format!("dial failed: {}", e))).await;
            return;
        }
        Err(_) => {
            warn!("Dial {} timed out", shared.local_addr);
            shared.finish(&connection_id, Some("dial timed out".to_string())).await;
            return;
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    let _ = stream.set_nodelay(true);
    if shared
        .control
        .send_message(&ControlMessage::open_ok(&connection_id))
        .await
        .is_err()
    {
        return;
    }
    info!("Connection {} -> {}", connection_id, shared.local_addr);

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(shared.clone(), connection_id.clone(), writer, rx));
    read_pump(shared, connection_id, reader, cancel).await;
}

async fn read_pump(
    shared: Arc<Shared>,
    connection_id: String,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("local read for {} failed: {}", connection_id, e);
                    break;
                }
            },
        };
        if shared.control.send_frame(&connection_id, &buf[..n]).await.is_err() {
            return;
        }
    }
    shared.finish(&connection_id, None).await;
}

/// Drains what is queued once the connection is removed, then half-closes
async fn write_loop(
    shared: Arc<Shared>,
    connection_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!("local write for {} failed: {}", connection_id, e);
            shared.finish(&connection_id, None).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Replies from the local service for one UDP flow
async fn udp_replies(
    shared: Arc<Shared>,
    flow_id: String,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = tokio::time::timeout(shared.idle_timeout, socket.recv(&mut buf)) => received,
        };
        match received {
            Ok(Ok(n)) => {
                if shared.control.send_frame(&flow_id, &buf[..n]).await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                debug!("udp receive for {} failed: {}", flow_id, e);
                break;
            }
            Err(_) => break,
        }
    }
    shared.finish_flow(&flow_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_shared::Outbound;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    fn spec(kind: TunnelType, port: u16) -> TunnelSpec {
        TunnelSpec {
            kind,
            local_host: "127.0.0.1".into(),
            local_port: port,
            subdomain: None,
            desired_port: None,
        }
    }

    async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> ControlMessage {
        match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            Outbound::Text(text) => ControlMessage::from_json(&text).unwrap(),
            other => panic!("expected a control message, got {:?}", other),
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> (String, Vec<u8>) {
        match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            Outbound::Binary(buf) => {
                let frame = BinaryFrame::decode(&buf).unwrap();
                (frame.connection_id.to_string(), frame.payload.to_vec())
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_failure_reports_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (control, mut rx) = ControlSender::channel(16);
        let forwarder = NetForwarder::new(TunnelType::Tcp, &spec(TunnelType::Tcp, port), control);
        forwarder.on_message(ControlMessage::open("c1")).await;

        match next_message(&mut rx).await {
            ControlMessage::Close {
                connection_id,
                close_reason,
                ..
            } => {
                assert_eq!(connection_id, "c1");
                assert!(close_reason.unwrap().starts_with("dial failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(forwarder.shared.streams.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_echo_through_forwarder() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let (control, mut rx) = ControlSender::channel(16);
        let forwarder = NetForwarder::new(TunnelType::Tcp, &spec(TunnelType::Tcp, port), control);
        forwarder.on_message(ControlMessage::open("c1")).await;
        assert_eq!(next_message(&mut rx).await, ControlMessage::open_ok("c1"));

        let frame = portway_shared::frame::encode("c1", b"ping").unwrap();
        forwarder.on_frame(BinaryFrame::decode(&frame).unwrap()).await;
        assert_eq!(next_frame(&mut rx).await, ("c1".to_string(), b"ping".to_vec()));

        // local side closes after echoing
        assert_eq!(next_message(&mut rx).await, ControlMessage::close("c1"));
        assert!(forwarder.shared.streams.is_empty());

        // events for the closed id are no-ops
        forwarder.on_message(ControlMessage::close("c1")).await;
        forwarder.on_message(ControlMessage::binary("c1", b"late".to_vec())).await;
    }

    #[tokio::test]
    async fn test_udp_flow_round_trip_and_idle_close() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = local.recv_from(&mut buf).await.unwrap();
            local.send_to(&buf[..n], from).await.unwrap();
        });

        let (control, mut rx) = ControlSender::channel(16);
        let forwarder = NetForwarder::with_idle_timeout(
            TunnelType::Udp,
            &spec(TunnelType::Udp, port),
            control,
            Duration::from_millis(200),
        );
        forwarder
            .on_message(ControlMessage::binary("203.0.113.9:5353", b"query".to_vec()))
            .await;
        assert_eq!(
            next_frame(&mut rx).await,
            ("203.0.113.9:5353".to_string(), b"query".to_vec())
        );

        // no more replies: the flow expires and CLOSE goes upstream
        assert_eq!(next_message(&mut rx).await, ControlMessage::close("203.0.113.9:5353"));
        assert!(forwarder.shared.flows.is_empty());
    }
}
