//! Threat filtering at the public edge.
//!
//! Accept and receive loops consult a [`ThreatFilter`] for every inbound
//! peer before a connection id is minted. Checks are in-memory lookups;
//! indicator feeds are refreshed out of band on a timer.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::warn;

/// Outcome of a threat check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub(crate) fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

pub trait ThreatFilter: Send + Sync {
    /// Decide whether a peer may reach a tunnel. Must not block.
    fn check(&self, host: &str, port: u16) -> Verdict;
}

/// Lets everything through
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ThreatFilter for AllowAll {
    fn check(&self, _host: &str, _port: u16) -> Verdict {
        Verdict::Allow
    }
}

/// Denies when any member denies
#[derive(Clone, Default)]
pub struct ChainFilter {
    filters: Vec<Arc<dyn ThreatFilter>>,
}

impl ChainFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Arc<dyn ThreatFilter>) -> Self {
        self.filters.push(filter);
        self
    }
}

impl ThreatFilter for ChainFilter {
    fn check(&self, host: &str, port: u16) -> Verdict {
        for filter in &self.filters {
            let verdict = filter.check(host, port);
            if !verdict.is_allowed() {
                return verdict;
            }
        }
        Verdict::Allow
    }
}

/// Indicator-of-compromise cache keyed by `host` and `host:port`
#[derive(Default)]
pub struct IocThreatFilter {
    fixed: HashSet<String>,
    feed: ArcSwap<HashSet<String>>,
}

/// ThreatFox IOC types the cache keeps
const IOC_TYPE_IP_PORT: &str = "ip:port";
const IOC_TYPE_DOMAIN: &str = "domain";

impl IocThreatFilter {
    /// A filter seeded with indicators that never expire
    pub fn new(fixed: &[String]) -> Self {
        Self {
            fixed: fixed.iter().map(|s| normalize(s)).filter(|s| !s.is_empty()).collect(),
            feed: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    /// Replace the feed indicators. Returns how many were loaded.
    pub fn refresh_from(&self, iocs: &[ThreatFoxIoc]) -> usize {
        let next: HashSet<String> = iocs
            .iter()
            .filter(|ioc| {
                ioc.ioc_type.eq_ignore_ascii_case(IOC_TYPE_IP_PORT)
                    || ioc.ioc_type.eq_ignore_ascii_case(IOC_TYPE_DOMAIN)
            })
            .map(|ioc| normalize(&ioc.ioc))
            .filter(|s| !s.is_empty())
            .collect();
        let count = next.len();
        self.feed.store(Arc::new(next));
        count
    }

    pub fn len(&self) -> usize {
        self.fixed.len() + self.feed.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_listed(&self, key: &str) -> bool {
        self.fixed.contains(key) || self.feed.load().contains(key)
    }
}

impl ThreatFilter for IocThreatFilter {
    fn check(&self, host: &str, port: u16) -> Verdict {
        let host = normalize(host);
        if host.is_empty() {
            return Verdict::Allow;
        }
        if self.is_listed(&host) {
            warn!("threat blocked: host {} matches ioc", host);
            return Verdict::Deny(format!("host is blacklisted: {}", host));
        }
        let host_port = format!("{}:{}", host, port);
        if self.is_listed(&host_port) {
            warn!("threat blocked: {} matches ioc", host_port);
            return Verdict::Deny(format!("peer is blacklisted: {}", host_port));
        }
        Verdict::Allow
    }
}

fn normalize(ioc: &str) -> String {
    ioc.trim().to_lowercase()
}

/// One ThreatFox indicator
#[derive(Debug, Clone, Deserialize)]
pub struct ThreatFoxIoc {
    pub ioc: String,
    pub ioc_type: String,
    #[serde(default)]
    pub threat_type: Option<String>,
    #[serde(default)]
    pub malware_printable: Option<String>,
    #[serde(default)]
    pub confidence_level: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreatFoxResponse {
    pub query_status: String,
    #[serde(default)]
    pub data: Option<Vec<ThreatFoxIoc>>,
}

#[cfg(feature = "threatfox")]
mod feed {
    use super::*;
    use crate::config::ThreatFoxConfig;
    use tokio::task::JoinHandle;
    use tracing::{error, info};

    pub async fn fetch(
        client: &reqwest::Client,
        config: &ThreatFoxConfig,
    ) -> anyhow::Result<Vec<ThreatFoxIoc>> {
        let mut request = client
            .post(&config.api_url)
            .json(&serde_json::json!({ "query": "get_iocs", "days": 1 }));
        if let Some(key) = &config.auth_key {
            request = request.header("Auth-Key", key);
        }
        let response: ThreatFoxResponse = request.send().await?.error_for_status()?.json().await?;
        if response.query_status != "ok" {
            anyhow::bail!("threatfox query status: {}", response.query_status);
        }
        Ok(response.data.unwrap_or_default())
    }

    /// Refresh `filter` now and then every `fetch_interval`
    pub fn spawn_refresh(filter: Arc<IocThreatFilter>, config: ThreatFoxConfig) -> JoinHandle<()> {
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(config.fetch_interval);
            loop {
                ticker.tick().await;
                match fetch(&client, &config).await {
                    Ok(iocs) => {
                        let count = filter.refresh_from(&iocs);
                        info!("threatfox cache updated: {} iocs loaded", count);
                    }
                    Err(e) => error!("threatfox fetch failed: {}", e),
                }
            }
        })
    }
}

#[cfg(feature = "threatfox")]
pub use feed::{fetch as fetch_threatfox, spawn_refresh};

/// A parsed CIDR range
#[derive(Debug, Clone)]
pub struct CidrRange {
    pub network: u32,
    pub mask: u32,
    pub raw: String,
}

impl CidrRange {
    /// Parse a CIDR string like "192.168.1.0/24"; a bare address is a /32
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix_len) = match cidr.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u32>().ok()?),
            None => (cidr, 32),
        };
        let ip: Ipv4Addr = addr.parse().ok()?;
        if prefix_len > 32 {
            return None;
        }

        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };

        Some(CidrRange {
            network: u32::from(ip) & mask,
            mask,
            raw: cidr.to_string(),
        })
    }

    /// Check if an IP address is within this CIDR range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => (u32::from(v4) & self.mask) == self.network,
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| (u32::from(v4) & self.mask) == self.network),
        }
    }
}

/// Static CIDR rules, deny first
#[derive(Debug, Clone, Default)]
pub struct CidrFilter {
    /// Allowed ranges (empty = allow all)
    pub allow: Vec<CidrRange>,
    pub deny: Vec<CidrRange>,
}

impl CidrFilter {
    pub fn from_strings(allow: &[String], deny: &[String]) -> Self {
        let parse = |list: &[String]| -> Vec<CidrRange> {
            list.iter()
                .filter_map(|s| {
                    let range = CidrRange::parse(s);
                    if range.is_none() {
                        warn!("ignoring invalid CIDR rule: {}", s);
                    }
                    range
                })
                .collect()
        };
        Self {
            allow: parse(allow),
            deny: parse(deny),
        }
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|cidr| cidr.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

impl ThreatFilter for CidrFilter {
    fn check(&self, host: &str, _port: u16) -> Verdict {
        match host.parse::<IpAddr>() {
            Ok(ip) if !self.is_allowed(ip) => Verdict::Deny(format!("{} rejected by CIDR rules", ip)),
            _ => Verdict::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ioc(value: &str, kind: &str) -> ThreatFoxIoc {
        ThreatFoxIoc {
            ioc: value.to_string(),
            ioc_type: kind.to_string(),
            threat_type: None,
            malware_printable: None,
            confidence_level: None,
        }
    }

    #[test]
    fn test_cidr_parse() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains("192.168.1.100".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.1".parse().unwrap()));
        assert!(cidr.contains("::ffff:192.168.1.7".parse().unwrap()));

        let single = CidrRange::parse("203.0.113.5").unwrap();
        assert!(single.contains("203.0.113.5".parse().unwrap()));
        assert!(!single.contains("203.0.113.6".parse().unwrap()));

        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("nonsense").is_none());
    }

    #[test]
    fn test_cidr_filter() {
        let filter = CidrFilter::from_strings(
            &["192.168.1.0/24".to_string()],
            &["192.168.1.100/32".to_string()],
        );

        assert!(filter.check("192.168.1.50", 80).is_allowed());
        assert!(!filter.check("192.168.1.100", 80).is_allowed());
        assert!(!filter.check("10.0.0.1", 80).is_allowed());
        // not an address: nothing to match
        assert!(filter.check("example.com", 80).is_allowed());
    }

    #[test]
    fn test_ioc_host_and_host_port() {
        let filter = IocThreatFilter::new(&["203.0.113.5".to_string()]);
        assert!(!filter.check("203.0.113.5", 40000).is_allowed());
        assert!(filter.check("203.0.113.6", 40000).is_allowed());

        let loaded = filter.refresh_from(&[
            ioc("198.51.100.7:4444", "ip:port"),
            ioc("Evil.Example", "domain"),
            ioc("http://evil.example/x", "url"),
        ]);
        assert_eq!(loaded, 2);
        assert!(!filter.check("198.51.100.7", 4444).is_allowed());
        assert!(filter.check("198.51.100.7", 4445).is_allowed());
        assert!(!filter.check("evil.example", 1).is_allowed());
        // fixed entries survive a refresh
        assert!(!filter.check("203.0.113.5", 1).is_allowed());
    }

    #[test]
    fn test_refresh_replaces_feed() {
        let filter = IocThreatFilter::new(&[]);
        filter.refresh_from(&[ioc("198.51.100.7:4444", "ip:port")]);
        filter.refresh_from(&[]);
        assert!(filter.check("198.51.100.7", 4444).is_allowed());
        assert!(filter.is_empty());
    }

    #[test]
    fn test_chain_denies_if_any_member_denies() {
        let chain = ChainFilter::new()
            .with(Arc::new(AllowAll))
            .with(Arc::new(CidrFilter::from_strings(&[], &["10.0.0.0/8".to_string()])));
        assert!(chain.check("8.8.8.8", 53).is_allowed());
        assert!(matches!(chain.check("10.1.2.3", 53), Verdict::Deny(_)));
    }

    #[test]
    fn test_parse_threatfox_response() {
        let body = r#"{"query_status":"ok","data":[
            {"id":"1","ioc":"1.2.3.4:80","ioc_type":"ip:port","threat_type":"botnet_cc",
             "malware_printable":"Cobalt Strike","confidence_level":100}]}"#;
        let parsed: ThreatFoxResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.unwrap()[0].ioc, "1.2.3.4:80");
    }
}
