//! TCP and UDP tunnels
//!
//! Each exposed port gets one background loop: an accept loop for TCP, a
//! receive loop for UDP. TCP connections move through
//! `Accepted -> Pumping -> Closed`; bytes from the public socket are only
//! read once the client acknowledged the OPEN, and bytes from the client
//! are written by one writer task per connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portway_shared::{ConnectionTable, ControlMessage, ControlSender, Error, Result, TunnelType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::registry::TunnelSnapshot;
use crate::threat::{ThreatFilter, Verdict};

const READ_BUF_SIZE: usize = 16 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;
/// Chunks queued toward one public socket
const WRITE_QUEUE: usize = 64;
/// Pause after a failed accept or receive before polling the socket again
const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Result of an expose call for a port-bound tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedPort {
    pub kind: TunnelType,
    pub port: u16,
}

enum ConnState {
    /// Accepted and announced; waiting for OPEN_OK
    Accepted(OwnedReadHalf),
    Pumping,
    Closed,
}

/// A public TCP connection
pub struct PublicConnection {
    pub peer: SocketAddr,
    /// Control channel the OPEN was announced on
    channel: u64,
    state: Mutex<ConnState>,
    /// Queue drained by the connection's writer task
    writer: mpsc::Sender<Bytes>,
    /// Stops the read pump
    cancel: CancellationToken,
}

impl PublicConnection {
    async fn shutdown(&self) {
        self.cancel.cancel();
        *self.state.lock().await = ConnState::Closed;
    }
}

/// A TCP or UDP tunnel bound to a public port
pub struct NetTunnel {
    pub tunnel_id: String,
    pub kind: TunnelType,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    control: ArcSwapOption<ControlSender>,
    idle_since: ArcSwapOption<Instant>,
    /// Stops the accept/receive loop and every writer task
    shutdown: CancellationToken,
    pub connections: ConnectionTable<PublicConnection>,
    udp_socket: Option<Arc<UdpSocket>>,
    /// UDP flow id (`ip:port`) -> return address
    pub udp_peers: ConnectionTable<SocketAddr>,
    metrics: Metrics,
}

impl NetTunnel {
    fn new(
        tunnel_id: String,
        kind: TunnelType,
        port: u16,
        udp_socket: Option<Arc<UdpSocket>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            tunnel_id,
            kind,
            port,
            created_at: Utc::now(),
            control: ArcSwapOption::empty(),
            idle_since: ArcSwapOption::from_pointee(Instant::now()),
            shutdown: CancellationToken::new(),
            connections: ConnectionTable::new(),
            udp_socket,
            udp_peers: ConnectionTable::new(),
            metrics,
        }
    }

    pub fn control(&self) -> Option<Arc<ControlSender>> {
        self.control.load_full().filter(|c| !c.is_closed())
    }

    pub fn is_attached(&self) -> bool {
        self.control().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.idle_since
            .load()
            .as_deref()
            .map(|since| now.saturating_duration_since(*since))
    }

    /// Register an accepted socket and announce it to the client
    async fn open_tcp(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, control: &ControlSender) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let cancel = self.shutdown.child_token();

        let (id, _) = self.connections.open(PublicConnection {
            peer,
            channel: control.id(),
            state: Mutex::new(ConnState::Accepted(read_half)),
            writer: tx,
            cancel,
        });
        tokio::spawn(write_loop(self.clone(), id.clone(), write_half, rx));

        if let Err(e) = control.send_message(&ControlMessage::open(&id)).await {
            debug!("OPEN for {} not delivered: {}", id, e);
            self.drop_connection(&id).await;
            return;
        }
        // close_tunnel may have drained the table while we were announcing
        if self.is_closed() {
            self.drop_connection(&id).await;
            return;
        }
        self.metrics.connection_opened();
        debug!("[{}] opened {} from {}", self.tunnel_id, id, peer);
    }

    /// Client reached its local service; start relaying public bytes.
    /// A repeated OPEN_OK is a no-op.
    pub async fn on_open_ok(self: &Arc<Self>, connection_id: &str) {
        let Some(conn) = self.connections.get(connection_id) else {
            debug!("OPEN_OK for unknown connection {}", connection_id);
            return;
        };
        let reader = {
            let mut state = conn.state.lock().await;
            match std::mem::replace(&mut *state, ConnState::Pumping) {
                ConnState::Accepted(reader) => reader,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        tokio::spawn(read_pump(
            self.clone(),
            connection_id.to_string(),
            reader,
            conn.cancel.clone(),
        ));
    }

    /// Payload from the client for one connection
    pub async fn on_client_bytes(&self, connection_id: &str, data: Bytes) {
        let len = data.len() as u64;
        match self.kind {
            TunnelType::Udp => {
                let (Some(socket), Some(addr)) = (&self.udp_socket, self.udp_peers.get(connection_id))
                else {
                    return;
                };
                if let Err(e) = socket.send_to(&data, *addr).await {
                    debug!("udp send to {} failed: {}", addr, e);
                    return;
                }
            }
            _ => {
                let Some(conn) = self.connections.get(connection_id) else {
                    return;
                };
                if conn.writer.send(data).await.is_err() {
                    return;
                }
            }
        }
        self.metrics.add_bytes_out(len);
    }

    /// CLOSE from the client. Unknown or already closed ids are ignored.
    pub async fn on_client_close(&self, connection_id: &str) {
        match self.kind {
            TunnelType::Udp => {
                self.udp_peers.remove(connection_id);
            }
            _ => self.drop_connection(connection_id).await,
        }
    }

    /// Tear down a connection without notifying the client
    async fn drop_connection(&self, connection_id: &str) {
        if let Some(conn) = self.connections.remove(connection_id) {
            conn.shutdown().await;
        }
    }

    /// Tear down a connection from the public side and tell the client.
    /// Only the caller that wins the removal sends CLOSE.
    async fn finish(&self, connection_id: &str) {
        let Some(conn) = self.connections.remove(connection_id) else {
            return;
        };
        conn.shutdown().await;
        if let Some(control) = self.control() {
            let _ = control.send_message(&ControlMessage::close(connection_id)).await;
        }
        debug!("[{}] closed {}", self.tunnel_id, connection_id);
    }

    /// Close the connections announced on `channel` and forget UDP flows.
    /// The client that owned them is gone, so no CLOSE is sent.
    async fn end_session(&self, channel: u64) {
        for id in self.connections.ids() {
            let owned = self
                .connections
                .get(&id)
                .is_some_and(|conn| conn.channel == channel);
            if owned {
                self.drop_connection(&id).await;
            }
        }
        self.udp_peers.drain();
    }

    /// Close every live connection and forget UDP flows
    async fn close_connections(&self) {
        let control = self.control();
        for (id, conn) in self.connections.drain() {
            conn.shutdown().await;
            if let Some(control) = &control {
                let _ = control.send_message(&ControlMessage::close(&id)).await;
            }
        }
        self.udp_peers.drain();
    }

    fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            tunnel_id: self.tunnel_id.clone(),
            kind: self.kind,
            subdomain: None,
            port: Some(self.port),
            attached: self.is_attached(),
            connections: match self.kind {
                TunnelType::Udp => self.udp_peers.len(),
                _ => self.connections.len(),
            },
            created_at: self.created_at,
        }
    }
}

/// Waits out a socket error. Returns false when the tunnel shut down meanwhile.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(SOCKET_ERROR_BACKOFF) => true,
    }
}

async fn accept_loop(tunnel: Arc<NetTunnel>, listener: TcpListener, threats: Arc<dyn ThreatFilter>) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = tunnel.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("[{}] accept failed: {}", tunnel.tunnel_id, e);
                    if !back_off(&tunnel.shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if let Verdict::Deny(reason) = threats.check(&peer.ip().to_string(), peer.port()) {
            tunnel.metrics.connection_blocked();
            warn!("[{}] blocked {}: {}", tunnel.tunnel_id, peer, reason);
            continue;
        }
        let Some(control) = tunnel.control() else {
            debug!("[{}] no client attached, dropping {}", tunnel.tunnel_id, peer);
            continue;
        };
        tunnel.open_tcp(stream, peer, &control).await;
    }
    debug!("[{}] accept loop ended", tunnel.tunnel_id);
}

async fn receive_loop(tunnel: Arc<NetTunnel>, socket: Arc<UdpSocket>, threats: Arc<dyn ThreatFilter>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = tokio::select! {
            biased;
            _ = tunnel.shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("[{}] receive failed: {}", tunnel.tunnel_id, e);
                    if !back_off(&tunnel.shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };

        if let Verdict::Deny(reason) = threats.check(&peer.ip().to_string(), peer.port()) {
            tunnel.metrics.connection_blocked();
            warn!("[{}] blocked datagram from {}: {}", tunnel.tunnel_id, peer, reason);
            continue;
        }
        let Some(control) = tunnel.control() else {
            continue;
        };

        let id = peer.to_string();
        let (_, created) = tunnel.udp_peers.insert_or_get(&id, || peer);
        if created {
            tunnel.metrics.connection_opened();
            debug!("[{}] new udp flow {}", tunnel.tunnel_id, id);
        }
        if let Err(e) = control.send_frame(&id, &buf[..n]).await {
            debug!("[{}] datagram from {} not relayed: {}", tunnel.tunnel_id, id, e);
            continue;
        }
        tunnel.metrics.add_bytes_in(n as u64);
    }
    debug!("[{}] receive loop ended", tunnel.tunnel_id);
}

/// Public socket -> client, started by OPEN_OK
async fn read_pump(
    tunnel: Arc<NetTunnel>,
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
                    debug!("read from {} failed: {}", connection_id, e);
                    break;
                }
            },
        };
        let Some(control) = tunnel.control() else {
            break;
        };
        if control.send_frame(&connection_id, &buf[..n]).await.is_err() {
            break;
        }
        tunnel.metrics.add_bytes_in(n as u64);
    }
    tunnel.finish(&connection_id).await;
}

/// Client -> public socket. Drains what is queued once the connection is
/// removed, then half-closes.
async fn write_loop(
    tunnel: Arc<NetTunnel>,
    connection_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    loop {
        let chunk = tokio::select! {
            _ = tunnel.shutdown.cancelled() => return,
            next = rx.recv() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&chunk).await {
            debug!("write to {} failed: {}", connection_id, e);
            tunnel.finish(&connection_id).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// TCP and UDP tunnels keyed by tunnel id
pub struct NetTunnelRegistry {
    tunnels: DashMap<String, Arc<NetTunnel>>,
    by_channel: DashMap<u64, String>,
    bind_ip: IpAddr,
    threats: Arc<dyn ThreatFilter>,
    metrics: Metrics,
}

impl NetTunnelRegistry {
    pub fn new(bind_ip: IpAddr, threats: Arc<dyn ThreatFilter>, metrics: Metrics) -> Self {
        Self {
            tunnels: DashMap::new(),
            by_channel: DashMap::new(),
            bind_ip,
            threats,
            metrics,
        }
    }

    /// Bind a public port for `tunnel_id` and start its loop. The requested
    /// port is tried first; any bind failure falls back to an ephemeral one.
    /// Calling again for a live tunnel returns the port already bound.
    pub async fn expose(
        &self,
        tunnel_id: &str,
        kind: TunnelType,
        desired_port: Option<u16>,
    ) -> Result<ExposedPort> {
        if let Some(existing) = self.get(tunnel_id) {
            return Ok(ExposedPort { kind: existing.kind, port: existing.port });
        }

        enum Bound {
            Tcp(TcpListener),
            Udp(Arc<UdpSocket>),
        }
        let bound = match kind {
            TunnelType::Tcp => Bound::Tcp(self.bind_tcp(desired_port).await?),
            TunnelType::Udp => Bound::Udp(Arc::new(self.bind_udp(desired_port).await?)),
            TunnelType::Http => {
                return Err(Error::Protocol("http tunnels are not port-bound".into()))
            }
        };
        let port = match &bound {
            Bound::Tcp(listener) => listener.local_addr()?.port(),
            Bound::Udp(socket) => socket.local_addr()?.port(),
        };

        let tunnel = match self.tunnels.entry(tunnel_id.to_string()) {
            // lost a race with a concurrent expose; our socket is dropped here
            Entry::Occupied(e) => {
                let existing = e.get();
                return Ok(ExposedPort { kind: existing.kind, port: existing.port });
            }
            Entry::Vacant(slot) => {
                let udp = match &bound {
                    Bound::Udp(socket) => Some(socket.clone()),
                    Bound::Tcp(_) => None,
                };
                let tunnel = Arc::new(NetTunnel::new(
                    tunnel_id.to_string(),
                    kind,
                    port,
                    udp,
                    self.metrics.clone(),
                ));
                slot.insert(tunnel.clone());
                tunnel
            }
        };

        match bound {
            Bound::Tcp(listener) => {
                tokio::spawn(accept_loop(tunnel, listener, self.threats.clone()));
            }
            Bound::Udp(socket) => {
                tokio::spawn(receive_loop(tunnel, socket, self.threats.clone()));
            }
        }
        info!("{} tunnel {} listening on {}:{}", kind, tunnel_id, self.bind_ip, port);
        Ok(ExposedPort { kind, port })
    }

    async fn bind_tcp(&self, desired: Option<u16>) -> Result<TcpListener> {
        if let Some(port) = desired.filter(|p| *p != 0) {
            match TcpListener::bind((self.bind_ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => warn!("tcp port {} unavailable ({}), using an ephemeral port", port, e),
            }
        }
        Ok(TcpListener::bind((self.bind_ip, 0)).await?)
    }

    async fn bind_udp(&self, desired: Option<u16>) -> Result<UdpSocket> {
        if let Some(port) = desired.filter(|p| *p != 0) {
            match UdpSocket::bind((self.bind_ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => warn!("udp port {} unavailable ({}), using an ephemeral port", port, e),
            }
        }
        Ok(UdpSocket::bind((self.bind_ip, 0)).await?)
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<NetTunnel>> {
        self.tunnels.get(tunnel_id).map(|t| t.value().clone())
    }

    /// False when the id was never exposed or is already closed. A channel
    /// replaced by a reconnect ends its session here, since its own detach
    /// will no longer find it.
    pub async fn attach_control_channel(&self, tunnel_id: &str, channel: ControlSender) -> bool {
        let Some(tunnel) = self.get(tunnel_id) else {
            return false;
        };
        let channel_id = channel.id();
        self.by_channel.insert(channel_id, tunnel_id.to_string());
        let previous = tunnel.control.swap(Some(Arc::new(channel)));
        tunnel.idle_since.store(None);
        match previous {
            Some(previous) if previous.id() != channel_id => {
                self.by_channel.remove(&previous.id());
                tunnel.end_session(previous.id()).await;
                info!("{} tunnel {} reconnected, previous session closed", tunnel.kind, tunnel_id);
            }
            _ => info!("{} tunnel session established: {}", tunnel.kind, tunnel_id),
        }
        true
    }

    /// Clear the control channel. Live connections cannot be served
    /// without it and are closed; the port stays bound for a reconnect.
    pub async fn detach_control_channel(&self, channel: &ControlSender) {
        let Some((_, tunnel_id)) = self.by_channel.remove(&channel.id()) else {
            return;
        };
        let Some(tunnel) = self.get(&tunnel_id) else {
            return;
        };
        let current = tunnel.control.load();
        if !current.as_deref().is_some_and(|c| c.same_channel(channel)) {
            return;
        }
        // a racing attach already replaced us and closed this session
        let previous = tunnel.control.compare_and_swap(&*current, None);
        if !previous.as_deref().is_some_and(|c| c.same_channel(channel)) {
            return;
        }
        tunnel.idle_since.store(Some(Arc::new(Instant::now())));
        tunnel.end_session(channel.id()).await;
        info!("{} tunnel session closed: {}", tunnel.kind, tunnel_id);
    }

    /// Stop accepting, close every connection, forget UDP flows, then
    /// detach the control channel.
    pub async fn close_tunnel(&self, tunnel_id: &str) -> bool {
        let Some((_, tunnel)) = self.tunnels.remove(tunnel_id) else {
            return false;
        };
        tunnel.shutdown.cancel();
        tunnel.close_connections().await;
        if let Some(control) = tunnel.control.swap(None) {
            self.by_channel.remove(&control.id());
            control.close().await;
        }
        info!("{} tunnel {} closed (port {})", tunnel.kind, tunnel_id, tunnel.port);
        true
    }

    /// Close tunnels whose control channel has been gone longer than `grace`
    pub async fn reap_idle(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .tunnels
            .iter()
            .filter(|t| t.idle_for(now).is_some_and(|idle| idle >= grace))
            .map(|t| t.key().clone())
            .collect();
        for id in &expired {
            info!("Reaping idle tunnel {}", id);
            self.close_tunnel(id).await;
        }
        expired
    }

    pub fn snapshots(&self) -> Vec<TunnelSnapshot> {
        self.tunnels.iter().map(|t| t.snapshot()).collect()
    }

    pub fn live_connections(&self) -> usize {
        self.tunnels
            .iter()
            .map(|t| t.connections.len() + t.udp_peers.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threat::{AllowAll, CidrFilter};
    use portway_shared::{BinaryFrame, Outbound};

    const WAIT: Duration = Duration::from_secs(2);

    fn registry_with(threats: Arc<dyn ThreatFilter>) -> NetTunnelRegistry {
        NetTunnelRegistry::new(IpAddr::from([127, 0, 0, 1]), threats, Metrics::new())
    }

    fn registry() -> NetTunnelRegistry {
        registry_with(Arc::new(AllowAll))
    }

    async fn next_out(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for control traffic")
            .expect("control channel closed")
    }

    async fn next_message(rx: &mut mpsc::Receiver<Outbound>) -> ControlMessage {
        match next_out(rx).await {
            Outbound::Text(text) => ControlMessage::from_json(&text).unwrap(),
            other => panic!("expected a control message, got {:?}", other),
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> (String, Vec<u8>) {
        match next_out(rx).await {
            Outbound::Binary(buf) => {
                let frame = BinaryFrame::decode(&buf).unwrap();
                (frame.connection_id.to_string(), frame.payload.to_vec())
            }
            other => panic!("expected a binary frame, got {:?}", other),
        }
    }

    async fn exposed_tcp(
        registry: &NetTunnelRegistry,
    ) -> (Arc<NetTunnel>, mpsc::Receiver<Outbound>, SocketAddr) {
        let exposed = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        let (sender, rx) = ControlSender::channel(64);
        assert!(registry.attach_control_channel("t1", sender).await);
        let addr = SocketAddr::from(([127, 0, 0, 1], exposed.port));
        (registry.get("t1").unwrap(), rx, addr)
    }

    #[tokio::test]
    async fn test_tcp_round_trip_after_open_ok() {
        let registry = registry();
        let (tunnel, mut rx, addr) = exposed_tcp(&registry).await;

        let mut public = TcpStream::connect(addr).await.unwrap();
        let id = match next_message(&mut rx).await {
            ControlMessage::Open { connection_id, .. } => connection_id,
            other => panic!("unexpected {:?}", other),
        };

        public.write_all(b"hello").await.unwrap();
        // nothing is relayed until the client acknowledges
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        tunnel.on_open_ok(&id).await;
        tunnel.on_open_ok(&id).await;
        assert_eq!(next_frame(&mut rx).await, (id.clone(), b"hello".to_vec()));

        tunnel.on_client_bytes(&id, Bytes::from_static(b"world")).await;
        let mut buf = [0u8; 5];
        tokio::time::timeout(WAIT, public.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"world");

        drop(public);
        match next_message(&mut rx).await {
            ControlMessage::Close { connection_id, .. } => assert_eq!(connection_id, id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tunnel.connections.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_peer_never_announced() {
        let deny = CidrFilter::from_strings(&[], &["127.0.0.1".to_string()]);
        let registry = registry_with(Arc::new(deny));
        let (tunnel, mut rx, addr) = exposed_tcp(&registry).await;

        let mut public = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, public.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert!(tunnel.connections.is_empty());
        assert_eq!(registry.metrics.connections_blocked(), 1);
    }

    #[tokio::test]
    async fn test_client_close_is_idempotent() {
        let registry = registry();
        let (tunnel, mut rx, addr) = exposed_tcp(&registry).await;

        let mut public = TcpStream::connect(addr).await.unwrap();
        let id = next_message(&mut rx).await.connection_id().unwrap().to_string();
        tunnel.on_open_ok(&id).await;

        tunnel.on_client_bytes(&id, Bytes::from_static(b"bye")).await;
        tunnel.on_client_close(&id).await;
        tunnel.on_client_close(&id).await;

        // queued bytes are flushed before the socket closes
        let mut got = Vec::new();
        tokio::time::timeout(WAIT, public.read_to_end(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, b"bye");
        assert!(!tunnel.connections.contains(&id));
        // the relay does not echo a CLOSE back
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_busy_port_falls_back() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy = taken.local_addr().unwrap().port();

        let registry = registry();
        let exposed = registry.expose("t1", TunnelType::Tcp, Some(busy)).await.unwrap();
        assert_ne!(exposed.port, busy);
        assert_ne!(exposed.port, 0);

        let again = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        assert_eq!(again, exposed);
    }

    #[tokio::test]
    async fn test_udp_flows_keyed_by_source() {
        let registry = registry();
        let exposed = registry.expose("u1", TunnelType::Udp, None).await.unwrap();
        let (sender, mut rx) = ControlSender::channel(64);
        registry.attach_control_channel("u1", sender).await;
        let tunnel = registry.get("u1").unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], exposed.port));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"one", target).await.unwrap();
        let (id_a1, payload) = next_frame(&mut rx).await;
        assert_eq!(payload, b"one");
        a.send_to(b"two", target).await.unwrap();
        let (id_a2, _) = next_frame(&mut rx).await;
        b.send_to(b"three", target).await.unwrap();
        let (id_b, _) = next_frame(&mut rx).await;

        assert_eq!(id_a1, id_a2);
        assert_eq!(id_a1, a.local_addr().unwrap().to_string());
        assert_ne!(id_a1, id_b);

        tunnel.on_client_bytes(&id_a1, Bytes::from_static(b"pong")).await;
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(WAIT, a.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"pong");

        tunnel.on_client_close(&id_a1).await;
        assert!(!tunnel.udp_peers.contains(&id_a1));
        assert!(tunnel.udp_peers.contains(&id_b));
    }

    #[tokio::test]
    async fn test_close_tunnel_tears_everything_down() {
        let registry = registry();
        let (tunnel, mut rx, addr) = exposed_tcp(&registry).await;

        let mut public = TcpStream::connect(addr).await.unwrap();
        let id = next_message(&mut rx).await.connection_id().unwrap().to_string();

        assert!(registry.close_tunnel("t1").await);
        assert!(!registry.close_tunnel("t1").await);

        assert!(tunnel.is_closed());
        assert!(tunnel.connections.is_empty());
        match next_message(&mut rx).await {
            ControlMessage::Close { connection_id, .. } => assert_eq!(connection_id, id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(next_out(&mut rx).await, Outbound::Close);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, public.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(registry.get("t1").is_none());
    }

    #[tokio::test]
    async fn test_accept_without_client_drops_socket() {
        let registry = registry();
        let exposed = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        let tunnel = registry.get("t1").unwrap();

        let mut public = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, public.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(tunnel.connections.is_empty());
    }

    #[tokio::test]
    async fn test_detach_closes_live_connections() {
        let registry = registry();
        let exposed = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        let (sender, mut rx) = ControlSender::channel(64);
        registry.attach_control_channel("t1", sender.clone()).await;
        let tunnel = registry.get("t1").unwrap();

        let _public = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
        next_message(&mut rx).await;
        assert_eq!(tunnel.connections.len(), 1);

        registry.detach_control_channel(&sender).await;
        assert!(tunnel.connections.is_empty());
        assert!(!tunnel.is_attached());
        // the port stays bound for a reconnecting client
        assert!(registry.get("t1").is_some());
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_session_connections() {
        let registry = registry();
        let exposed = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        let tunnel = registry.get("t1").unwrap();
        let (old, mut old_rx) = ControlSender::channel(64);
        registry.attach_control_channel("t1", old.clone()).await;

        let mut stale = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
        let stale_id = next_message(&mut old_rx).await.connection_id().unwrap().to_string();
        tunnel.on_open_ok(&stale_id).await;

        // the client reconnects before the relay notices the old socket died
        let (new, mut new_rx) = ControlSender::channel(64);
        registry.attach_control_channel("t1", new.clone()).await;
        let _fresh = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
        let fresh_id = next_message(&mut new_rx).await.connection_id().unwrap().to_string();

        registry.detach_control_channel(&old).await;

        assert!(!tunnel.connections.contains(&stale_id));
        assert!(tunnel.connections.contains(&fresh_id));
        assert!(tunnel.control().unwrap().same_channel(&new));

        let _ = stale.write_all(b"orphan").await;
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, stale.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        // nothing from the old connection leaks onto the new channel
        assert!(tokio::time::timeout(Duration::from_millis(100), new_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_detach_after_losing_race_leaves_new_session() {
        let registry = registry();
        let exposed = registry.expose("t1", TunnelType::Tcp, None).await.unwrap();
        let tunnel = registry.get("t1").unwrap();
        let (old, _old_rx) = ControlSender::channel(64);
        let (new, mut new_rx) = ControlSender::channel(64);
        registry.attach_control_channel("t1", old.clone()).await;
        registry.attach_control_channel("t1", new.clone()).await;

        let _public = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
        next_message(&mut new_rx).await;

        registry.detach_control_channel(&old).await;
        registry.detach_control_channel(&old).await;
        assert_eq!(tunnel.connections.len(), 1);
        assert!(tunnel.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_error_backoff_waits_then_resumes() {
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        assert!(back_off(&shutdown).await);
        assert!(started.elapsed() >= SOCKET_ERROR_BACKOFF);

        shutdown.cancel();
        let started = Instant::now();
        assert!(!back_off(&shutdown).await);
        assert!(started.elapsed() < SOCKET_ERROR_BACKOFF);
    }
}
