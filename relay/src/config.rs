//! Relay configuration, read from the environment.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// ThreatFox indicator feed settings
#[derive(Debug, Clone)]
pub struct ThreatFoxConfig {
    pub api_url: String,
    pub auth_key: Option<String>,
    pub fetch_interval: Duration,
}

impl Default for ThreatFoxConfig {
    fn default() -> Self {
        Self {
            api_url: "https://threatfox-api.abuse.ch/api/v1/".to_string(),
            auth_key: None,
            fetch_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base domain; HTTP tunnels live at `<subdomain>.<domain>`
    pub domain: String,
    /// Port of the HTTP/WebSocket listener
    pub port: u16,
    /// Scheme used in public URLs handed back by the expose API
    pub public_scheme: String,
    /// Host name reported for TCP/UDP tunnels
    pub public_host: String,
    /// Address TCP/UDP tunnel listeners bind to
    pub bind_ip: IpAddr,
    /// Default bound on unary request/response correlation
    pub request_timeout: Duration,
    /// How long a tunnel without a control channel is kept for reconnection
    pub grace_period: Duration,
    /// Largest request body relayed through a unary HTTP tunnel
    pub max_body_bytes: usize,
    pub allow_cidrs: Vec<String>,
    pub deny_cidrs: Vec<String>,
    /// Static indicators (`host` or `host:port`) refused at the public edge
    pub threat_iocs: Vec<String>,
    pub threatfox: ThreatFoxConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            port: 8080,
            public_scheme: "https".to_string(),
            public_host: "localhost".to_string(),
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            request_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
            max_body_bytes: 10 * 1024 * 1024,
            allow_cidrs: Vec::new(),
            deny_cidrs: Vec::new(),
            threat_iocs: Vec::new(),
            threatfox: ThreatFoxConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = RelayConfig::default();

        if let Some(domain) = lookup("PORTWAY_DOMAIN") {
            config.public_host = domain.clone();
            config.domain = domain;
        }
        if let Some(host) = lookup("PORTWAY_PUBLIC_HOST") {
            config.public_host = host;
        }
        if let Some(scheme) = lookup("PORTWAY_PUBLIC_SCHEME") {
            config.public_scheme = scheme;
        }
        if let Some(port) = lookup("PORT") {
            config.port = port.parse().with_context(|| format!("Invalid PORT: {}", port))?;
        }
        if let Some(ip) = lookup("PORTWAY_BIND_IP") {
            config.bind_ip = ip
                .parse()
                .with_context(|| format!("Invalid PORTWAY_BIND_IP: {}", ip))?;
        }
        if let Some(secs) = lookup("PORTWAY_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_u64("PORTWAY_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("PORTWAY_GRACE_SECS") {
            config.grace_period = Duration::from_secs(parse_u64("PORTWAY_GRACE_SECS", &secs)?);
        }
        if let Some(bytes) = lookup("PORTWAY_MAX_BODY_BYTES") {
            config.max_body_bytes = parse_u64("PORTWAY_MAX_BODY_BYTES", &bytes)? as usize;
        }
        if let Some(list) = lookup("PORTWAY_ALLOW_CIDRS") {
            config.allow_cidrs = split_list(&list);
        }
        if let Some(list) = lookup("PORTWAY_DENY_CIDRS") {
            config.deny_cidrs = split_list(&list);
        }
        if let Some(list) = lookup("PORTWAY_THREAT_IOCS") {
            config.threat_iocs = split_list(&list);
        }
        if let Some(url) = lookup("THREATFOX_API_URL") {
            config.threatfox.api_url = url;
        }
        config.threatfox.auth_key = lookup("THREATFOX_AUTH_KEY").filter(|k| !k.trim().is_empty());
        if let Some(minutes) = lookup("THREATFOX_FETCH_INTERVAL_MINUTES") {
            let minutes = parse_u64("THREATFOX_FETCH_INTERVAL_MINUTES", &minutes)?;
            if minutes > 0 {
                config.threatfox.fetch_interval = Duration::from_secs(minutes * 60);
            }
        }

        Ok(config)
    }

    /// Public URL of an HTTP tunnel
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.public_scheme, subdomain, self.domain)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.threatfox.fetch_interval, Duration::from_secs(3600));
        assert!(config.threatfox.auth_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("PORTWAY_DOMAIN", "tunnels.example.com"),
            ("PORT", "9000"),
            ("PORTWAY_DENY_CIDRS", "10.0.0.0/8, 192.168.0.0/16,"),
            ("PORTWAY_THREAT_IOCS", "203.0.113.5"),
            ("PORTWAY_GRACE_SECS", "10"),
        ]))
        .unwrap();

        assert_eq!(config.domain, "tunnels.example.com");
        assert_eq!(config.public_host, "tunnels.example.com");
        assert_eq!(config.port, 9000);
        assert_eq!(config.deny_cidrs, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(config.threat_iocs, vec!["203.0.113.5"]);
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.public_url("otter-4821"), "https://otter-4821.tunnels.example.com");
    }

    #[test]
    fn test_invalid_port() {
        assert!(RelayConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
    }
}
