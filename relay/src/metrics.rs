//! Relay metrics
//!
//! Request, byte and connection counters shared by every tunnel, a ring
//! buffer of unary request latencies, and the Prometheus text served on
//! `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Unary requests relayed through HTTP tunnels
    total_requests: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Public side -> client
    bytes_in: AtomicU64,
    /// Client -> public side
    bytes_out: AtomicU64,
    /// Logical connections opened on any tunnel
    connections_opened: AtomicU64,
    /// Peers refused by the threat filter
    connections_blocked: AtomicU64,
    /// Control messages that failed to parse
    malformed_messages: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

/// Point-in-time tunnel counts, read from the registries at scrape time
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelGauges {
    pub http_tunnels: usize,
    pub net_tunnels: usize,
    pub live_connections: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                connections_opened: AtomicU64::new(0),
                connections_blocked: AtomicU64::new(0),
                malformed_messages: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a completed unary request
    pub async fn record_request(&self, status: u16, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        self.add_bytes_in(bytes_in);
        self.add_bytes_out(bytes_out);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.inner.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.inner.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.inner.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_blocked(&self) {
        self.inner.connections_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.inner.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn connections_blocked(&self) -> u64 {
        self.inner.connections_blocked.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn malformed_messages(&self) -> u64 {
        self.inner.malformed_messages.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self, gauges: TunnelGauges) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP portway_requests_total Unary requests relayed through HTTP tunnels
# TYPE portway_requests_total counter
portway_requests_total {}

# HELP portway_tunnels Registered tunnels by kind
# TYPE portway_tunnels gauge
portway_tunnels{{kind="http"}} {}
portway_tunnels{{kind="net"}} {}

# HELP portway_connections Live logical connections
# TYPE portway_connections gauge
portway_connections {}

# HELP portway_connections_opened_total Logical connections opened
# TYPE portway_connections_opened_total counter
portway_connections_opened_total {}

# HELP portway_connections_blocked_total Peers refused by the threat filter
# TYPE portway_connections_blocked_total counter
portway_connections_blocked_total {}

# HELP portway_malformed_messages_total Control messages dropped as malformed
# TYPE portway_malformed_messages_total counter
portway_malformed_messages_total {}

# HELP portway_requests_by_status Requests by HTTP status class
# TYPE portway_requests_by_status counter
portway_requests_by_status{{status="2xx"}} {}
portway_requests_by_status{{status="3xx"}} {}
portway_requests_by_status{{status="4xx"}} {}
portway_requests_by_status{{status="5xx"}} {}

# HELP portway_bytes_total Total bytes relayed
# TYPE portway_bytes_total counter
portway_bytes_total{{direction="in"}} {}
portway_bytes_total{{direction="out"}} {}

# HELP portway_latency_us Request latency in microseconds
# TYPE portway_latency_us summary
portway_latency_us{{quantile="0.5"}} {}
portway_latency_us{{quantile="0.95"}} {}
portway_latency_us{{quantile="0.99"}} {}
portway_latency_us_avg {}
"#,
            self.inner.total_requests.load(Ordering::Relaxed),
            gauges.http_tunnels,
            gauges.net_tunnels,
            gauges.live_connections,
            self.inner.connections_opened.load(Ordering::Relaxed),
            self.inner.connections_blocked.load(Ordering::Relaxed),
            self.inner.malformed_messages.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_before_wraparound() {
        let mut hist = LatencyHistogram::new(100);
        for v in 1..=10 {
            hist.record(v * 100);
        }
        assert_eq!(hist.percentile(50.0), 600);
        assert_eq!(hist.percentile(99.0), 1000);
        assert_eq!(hist.average(), 550);
    }

    #[tokio::test]
    async fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_request(200, 1500, 10, 20).await;
        metrics.record_request(502, 800, 0, 0).await;
        metrics.connection_blocked();

        let text = metrics
            .to_prometheus(TunnelGauges { http_tunnels: 2, net_tunnels: 1, live_connections: 3 })
            .await;
        assert!(text.contains("portway_requests_total 2"));
        assert!(text.contains(r#"portway_requests_by_status{status="5xx"} 1"#));
        assert!(text.contains(r#"portway_tunnels{kind="http"} 2"#));
        assert!(text.contains("portway_connections_blocked_total 1"));
    }
}
