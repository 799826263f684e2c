//! HTTP tunnel registry for Portway Relay
//!
//! Tunnels are reserved before their client connects, so the public URL
//! can be handed out synchronously. The control channel attaches later and
//! may come and go; the tunnel entry outlives it until it is removed
//! explicitly or reaped after the grace window.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portway_shared::protocol::CLOSE_GOING_AWAY;
use portway_shared::{
    ConnectionTable, ControlMessage, ControlSender, Error, HttpRequest, HttpResponse, Result,
    TunnelType,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::correlator::{PendingRequests, DEFAULT_TIMEOUT};

/// Unique tunnel identifier
pub type TunnelId = String;

/// Frames queued for a bridged browser WebSocket
#[derive(Debug, Clone, PartialEq)]
pub enum ToBrowser {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

/// A browser WebSocket bridged through an HTTP tunnel
#[derive(Debug)]
pub struct BrowserPeer {
    tx: mpsc::Sender<ToBrowser>,
    /// Control channel the OPEN was announced on
    channel: u64,
}

impl BrowserPeer {
    pub fn new(tx: mpsc::Sender<ToBrowser>, channel: u64) -> Self {
        Self { tx, channel }
    }

    pub async fn send(&self, frame: ToBrowser) {
        if self.tx.send(frame).await.is_err() {
            debug!("browser socket already gone");
        }
    }

    /// Non-blocking close used during teardown
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(ToBrowser::Close(code, reason.to_string()));
    }
}

/// An HTTP tunnel
pub struct HttpTunnel {
    pub tunnel_id: TunnelId,
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
    control: ArcSwapOption<ControlSender>,
    /// Set while no control channel is attached
    idle_since: ArcSwapOption<Instant>,
    /// Pending request correlation map
    pub pending: PendingRequests,
    /// Bridged browser WebSockets
    pub browsers: ConnectionTable<BrowserPeer>,
}

impl HttpTunnel {
    fn new(subdomain: String, tunnel_id: TunnelId) -> Self {
        Self {
            tunnel_id,
            subdomain,
            created_at: Utc::now(),
            control: ArcSwapOption::empty(),
            idle_since: ArcSwapOption::from_pointee(Instant::now()),
            pending: PendingRequests::new(),
            browsers: ConnectionTable::new(),
        }
    }

    /// The attached control channel, if its writer is still running
    pub fn control(&self) -> Option<Arc<ControlSender>> {
        self.control.load_full().filter(|c| !c.is_closed())
    }

    pub fn is_attached(&self) -> bool {
        self.control().is_some()
    }

    /// Fail pending requests and close the browsers announced on `channel`;
    /// the client that knew their connection ids is gone
    fn end_session(&self, channel: u64) -> usize {
        let failed = self.pending.fail_all();
        for id in self.browsers.ids() {
            let owned = self
                .browsers
                .get(&id)
                .is_some_and(|peer| peer.channel == channel);
            if owned {
                if let Some(peer) = self.browsers.remove(&id) {
                    peer.close(CLOSE_GOING_AWAY, "tunnel disconnected");
                }
            }
        }
        failed
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.idle_since
            .load()
            .as_deref()
            .map(|since| now.saturating_duration_since(*since))
    }
}

/// Listing entry for the admin API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub kind: TunnelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub attached: bool,
    pub connections: usize,
    pub created_at: DateTime<Utc>,
}

pub struct TunnelRegistry {
    by_subdomain: DashMap<String, Arc<HttpTunnel>>,
    by_tunnel_id: DashMap<TunnelId, Arc<HttpTunnel>>,
    /// control channel id -> tunnel id
    by_channel: DashMap<u64, TunnelId>,
    default_timeout: Duration,
}

impl TunnelRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_tunnel_id: DashMap::new(),
            by_channel: DashMap::new(),
            default_timeout,
        }
    }

    /// Reserve a tunnel before its client connects. Without a subdomain a
    /// free random one is picked.
    pub fn create_pending(
        &self,
        subdomain: Option<String>,
        tunnel_id: TunnelId,
    ) -> Result<Arc<HttpTunnel>> {
        let explicit = subdomain.is_some();
        let mut candidate = subdomain.unwrap_or_else(random_subdomain).to_lowercase();
        loop {
            match self.by_subdomain.entry(candidate.clone()) {
                Entry::Occupied(_) if explicit => return Err(Error::SubdomainTaken(candidate)),
                Entry::Occupied(_) => candidate = random_subdomain(),
                Entry::Vacant(slot) => {
                    let tunnel = Arc::new(HttpTunnel::new(candidate.clone(), tunnel_id.clone()));
                    slot.insert(tunnel.clone());
                    self.by_tunnel_id.insert(tunnel_id, tunnel.clone());
                    info!("Tunnel reserved: {} ({})", tunnel.subdomain, tunnel.tunnel_id);
                    return Ok(tunnel);
                }
            }
        }
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Arc<HttpTunnel>> {
        self.by_subdomain.get(subdomain).map(|t| t.value().clone())
    }

    pub fn get_by_tunnel_id(&self, tunnel_id: &str) -> Option<Arc<HttpTunnel>> {
        self.by_tunnel_id.get(tunnel_id).map(|t| t.value().clone())
    }

    /// Bind a control channel to an issued tunnel id. False if the id was
    /// never issued (or already removed); the caller must drop the channel.
    /// A channel replaced by a reconnect ends its session here, since its
    /// own detach will no longer find it.
    pub fn attach_control_channel(&self, tunnel_id: &str, channel: ControlSender) -> bool {
        let Some(tunnel) = self.get_by_tunnel_id(tunnel_id) else {
            return false;
        };
        let channel_id = channel.id();
        self.by_channel.insert(channel_id, tunnel_id.to_string());
        let previous = tunnel.control.swap(Some(Arc::new(channel)));
        tunnel.idle_since.store(None);
        match previous {
            Some(previous) if previous.id() != channel_id => {
                self.by_channel.remove(&previous.id());
                let failed = tunnel.end_session(previous.id());
                info!(
                    "Tunnel {} reconnected ({} pending requests failed)",
                    tunnel_id, failed
                );
            }
            _ => info!("Tunnel session established: {}", tunnel_id),
        }
        true
    }

    /// Clear the control channel of whichever tunnel it is attached to.
    /// Idempotent; a channel already replaced by a reconnect is left alone.
    pub fn detach_control_channel(&self, channel: &ControlSender) {
        let Some((_, tunnel_id)) = self.by_channel.remove(&channel.id()) else {
            return;
        };
        let Some(tunnel) = self.get_by_tunnel_id(&tunnel_id) else {
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
        let failed = tunnel.end_session(channel.id());
        info!(
            "Tunnel session closed: {} ({} pending requests failed)",
            tunnel_id, failed
        );
    }

    /// Delete a tunnel and tear down everything hanging off it
    pub async fn remove(&self, tunnel: &HttpTunnel) {
        self.by_subdomain
            .remove_if(&tunnel.subdomain, |_, t| t.tunnel_id == tunnel.tunnel_id);
        self.by_tunnel_id.remove(&tunnel.tunnel_id);

        for (_, peer) in tunnel.browsers.drain() {
            peer.close(CLOSE_GOING_AWAY, "tunnel closed");
        }
        tunnel.pending.fail_all();
        if let Some(control) = tunnel.control.swap(None) {
            self.by_channel.remove(&control.id());
            control.close().await;
        }
        info!("Tunnel {} removed", tunnel.subdomain);
    }

    pub async fn remove_by_id(&self, tunnel_id: &str) -> bool {
        match self.get_by_tunnel_id(tunnel_id) {
            Some(tunnel) => {
                self.remove(&tunnel).await;
                true
            }
            None => false,
        }
    }

    /// Relay a unary request to the client serving `subdomain`
    pub async fn forward_request(
        &self,
        subdomain: &str,
        mut request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let tunnel = self
            .get_by_subdomain(subdomain)
            .ok_or(Error::TunnelUnavailable)?;
        let control = tunnel.control().ok_or(Error::TunnelUnavailable)?;

        let id = request
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let rx = tunnel.pending.register(id.clone());

        if let Err(e) = control.send_message(&ControlMessage::Request(request)).await {
            tunnel.pending.cancel(&id);
            return Err(e);
        }

        tunnel
            .pending
            .wait(&id, rx, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Deliver a RESPONSE from the client. Late or spurious ones are dropped.
    pub fn on_response(&self, tunnel_id: &str, response: HttpResponse) -> bool {
        match self.get_by_tunnel_id(tunnel_id) {
            Some(tunnel) => tunnel.pending.resolve(response),
            None => false,
        }
    }

    /// Remove tunnels whose control channel has been gone longer than `grace`
    pub async fn reap_idle(&self, grace: Duration) -> Vec<TunnelId> {
        let now = Instant::now();
        let expired: Vec<Arc<HttpTunnel>> = self
            .by_tunnel_id
            .iter()
            .filter(|t| t.idle_for(now).is_some_and(|idle| idle >= grace))
            .map(|t| t.value().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for tunnel in expired {
            info!("Reaping idle tunnel {}", tunnel.subdomain);
            self.remove(&tunnel).await;
            removed.push(tunnel.tunnel_id.clone());
        }
        removed
    }

    pub fn snapshots(&self) -> Vec<TunnelSnapshot> {
        self.by_tunnel_id
            .iter()
            .map(|t| TunnelSnapshot {
                tunnel_id: t.tunnel_id.clone(),
                kind: TunnelType::Http,
                subdomain: Some(t.subdomain.clone()),
                port: None,
                attached: t.is_attached(),
                connections: t.browsers.len(),
                created_at: t.created_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_tunnel_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tunnel_id.is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

const ANIMALS: &[&str] = &[
    "falcon", "lynx", "orca", "otter", "swift", "sparrow", "tiger", "puma",
];

/// `<animal>-<4 digits>`
pub fn random_subdomain() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let name = ANIMALS[rng.random_range(0..ANIMALS.len())];
    let num: u16 = rng.random_range(1000..10000);
    format!("{}-{}", name, num)
}
