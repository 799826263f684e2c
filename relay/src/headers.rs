//! Header rewriting for relayed HTTP exchanges
//!
//! Requests gain the standard proxy headers before they are handed to the
//! client. Responses lose the hop-by-hop headers that only made sense on
//! the client's local connection.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Headers scoped to a single connection; never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    /// Auto-inject standard proxy headers
    pub inject_proxy_headers: bool,
    /// Scheme reported in `X-Forwarded-Proto`
    pub forwarded_proto: String,
}

impl Default for HeaderRewriter {
    fn default() -> Self {
        Self {
            inject_proxy_headers: true,
            forwarded_proto: "https".to_string(),
        }
    }
}

impl HeaderRewriter {
    pub fn new(forwarded_proto: impl Into<String>) -> Self {
        Self {
            forwarded_proto: forwarded_proto.into(),
            ..Default::default()
        }
    }

    /// Rewrite request headers before forwarding to the client
    pub fn rewrite_request(
        &self,
        headers: &mut Vec<(String, String)>,
        client_ip: Option<IpAddr>,
        host: &str,
    ) {
        strip_hop_by_hop(headers);
        if !self.inject_proxy_headers {
            return;
        }
        if let Some(ip) = client_ip {
            let ip = ip.to_string();
            // append to an existing chain rather than replacing it
            match headers
                .iter_mut()
                .find(|(k, _)| k.eq_ignore_ascii_case("X-Forwarded-For"))
            {
                Some(h) => h.1 = format!("{}, {}", h.1, ip),
                None => headers.push(("X-Forwarded-For".to_string(), ip.clone())),
            }
            upsert(headers, "X-Real-IP", &ip);
        }
        upsert(headers, "X-Forwarded-Proto", &self.forwarded_proto);
        upsert(headers, "X-Forwarded-Host", host);
    }

    /// Rewrite response headers before sending back to the public caller.
    /// The body is re-framed by the server, so its length header goes too.
    pub fn rewrite_response(&self, headers: &mut Vec<(String, String)>) {
        strip_hop_by_hop(headers);
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
    }
}

fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)));
}

/// Insert or update a header
pub fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

/// First value of a header, case-insensitively
pub fn find<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Extract client IP from proxy headers, falling back to the peer address
pub fn extract_client_ip(
    headers: &[(String, String)],
    peer_addr: Option<SocketAddr>,
) -> Option<IpAddr> {
    if let Some(chain) = find(headers, "x-forwarded-for") {
        if let Some(ip) = chain.split(',').next().and_then(|s| IpAddr::from_str(s.trim()).ok()) {
            return Some(ip);
        }
    }
    if let Some(ip) = find(headers, "x-real-ip").and_then(|s| IpAddr::from_str(s.trim()).ok()) {
        return Some(ip);
    }
    peer_addr.map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_proxy_headers() {
        let rw = HeaderRewriter::default();
        let mut headers = h(&[("Host", "otter-4821.example.com")]);
        rw.rewrite_request(&mut headers, Some("1.2.3.4".parse().unwrap()), "otter-4821.example.com");
        assert_eq!(find(&headers, "x-forwarded-for"), Some("1.2.3.4"));
        assert_eq!(find(&headers, "X-Forwarded-Proto"), Some("https"));
        assert_eq!(find(&headers, "X-Forwarded-Host"), Some("otter-4821.example.com"));
    }

    #[test]
    fn test_forwarded_for_chain_is_extended() {
        let rw = HeaderRewriter::new("http");
        let mut headers = h(&[("X-Forwarded-For", "10.0.0.1")]);
        rw.rewrite_request(&mut headers, Some("1.2.3.4".parse().unwrap()), "a.example.com");
        assert_eq!(find(&headers, "X-Forwarded-For"), Some("10.0.0.1, 1.2.3.4"));
        assert_eq!(find(&headers, "X-Forwarded-Proto"), Some("http"));
    }

    #[test]
    fn test_response_hop_by_hop_stripped() {
        let rw = HeaderRewriter::default();
        let mut headers = h(&[
            ("Transfer-Encoding", "chunked"),
            ("Connection", "keep-alive"),
            ("Content-Length", "12"),
            ("Content-Type", "text/html"),
        ]);
        rw.rewrite_response(&mut headers);
        assert_eq!(headers, h(&[("Content-Type", "text/html")]));
    }

    #[test]
    fn test_extract_client_ip_prefers_headers() {
        let peer: SocketAddr = "9.9.9.9:5000".parse().unwrap();
        let headers = h(&[("X-Forwarded-For", "1.1.1.1, 2.2.2.2")]);
        assert_eq!(extract_client_ip(&headers, Some(peer)), Some("1.1.1.1".parse().unwrap()));
        assert_eq!(extract_client_ip(&[], Some(peer)), Some(peer.ip()));
        assert_eq!(extract_client_ip(&h(&[("x-real-ip", "3.3.3.3")]), None), Some("3.3.3.3".parse().unwrap()));
    }
}
