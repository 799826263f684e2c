//! Control-channel protocol types for Portway communication.
//!
//! Every control message is a JSON object carried in a text frame and
//! discriminated by its `type` field. Raw stream payloads travel separately
//! as binary frames (see [`crate::frame`]).

use serde::{Deserialize, Serialize};

use crate::Result;

/// Close code used when a peer goes away without a close frame of its own.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent to browsers when their tunnel is torn down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code reported when the local side of a bridged socket fails.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Map a received close code to one that may be sent in a close frame.
/// 1005, 1006 and 1015 are reserved for local reporting only.
pub fn sendable_close_code(code: Option<u16>) -> u16 {
    match code {
        Some(1005) | Some(1006) | Some(1015) | None => CLOSE_NORMAL,
        Some(code) if code < 1000 => CLOSE_NORMAL,
        Some(code) => code,
    }
}

/// Tunnel kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Http,
    Tcp,
    Udp,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Tcp => "tcp",
            TunnelType::Udp => "udp",
        }
    }
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unary HTTP request relayed to the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    /// Correlation id; assigned by the relay when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Response produced by the client's local service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl HttpResponse {
    /// Gateway failure reported in place of a local response
    pub fn bad_gateway(id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            status: 502,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: Some(format!("Bad Gateway: {}", detail).into_bytes()),
        }
    }
}

/// A message on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Relay -> client: perform a unary HTTP request
    Request(HttpRequest),
    /// Client -> relay: result of a `Request`
    Response(HttpResponse),
    /// A new logical connection was accepted on the public side
    #[serde(rename_all = "camelCase")]
    Open {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<(String, String)>,
    },
    /// The client reached its local service for this connection
    #[serde(rename_all = "camelCase")]
    OpenOk { connection_id: String },
    #[serde(rename_all = "camelCase")]
    Text { connection_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    Binary {
        connection_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_reason: Option<String>,
    },
}

impl ControlMessage {
    pub fn open(connection_id: impl Into<String>) -> Self {
        ControlMessage::Open {
            connection_id: connection_id.into(),
            path: None,
            query: None,
            headers: Vec::new(),
        }
    }

    pub fn open_ok(connection_id: impl Into<String>) -> Self {
        ControlMessage::OpenOk {
            connection_id: connection_id.into(),
        }
    }

    pub fn text(connection_id: impl Into<String>, text: impl Into<String>) -> Self {
        ControlMessage::Text {
            connection_id: connection_id.into(),
            text: text.into(),
        }
    }

    pub fn binary(connection_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        ControlMessage::Binary {
            connection_id: connection_id.into(),
            data: data.into(),
        }
    }

    pub fn close(connection_id: impl Into<String>) -> Self {
        ControlMessage::Close {
            connection_id: connection_id.into(),
            close_code: None,
            close_reason: None,
        }
    }

    pub fn close_with(
        connection_id: impl Into<String>,
        code: u16,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        ControlMessage::Close {
            connection_id: connection_id.into(),
            close_code: Some(code),
            close_reason: if reason.is_empty() { None } else { Some(reason) },
        }
    }

    /// Routing key of a connection event; `None` for HTTP exchange messages
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Request(_) | ControlMessage::Response(_) => None,
            ControlMessage::Open { connection_id, .. }
            | ControlMessage::OpenOk { connection_id }
            | ControlMessage::Text { connection_id, .. }
            | ControlMessage::Binary { connection_id, .. }
            | ControlMessage::Close { connection_id, .. } => Some(connection_id),
        }
    }

    /// Short name of the message kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Request(_) => "REQUEST",
            ControlMessage::Response(_) => "RESPONSE",
            ControlMessage::Open { .. } => "OPEN",
            ControlMessage::OpenOk { .. } => "OPEN_OK",
            ControlMessage::Text { .. } => "TEXT",
            ControlMessage::Binary { .. } => "BINARY",
            ControlMessage::Close { .. } => "CLOSE",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Body of an expose call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeRequest {
    /// Local host the client forwards to
    pub host: String,
    /// Local port the client forwards to
    pub port: u16,
    /// Preferred public port (TCP/UDP only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_port: Option<u16>,
    /// Preferred subdomain (HTTP only); random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

/// Public endpoint descriptor returned by an expose call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeResponse {
    pub tunnel_id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = ControlMessage::open_ok("c1").to_json().unwrap();
        assert_eq!(json, r#"{"type":"OPEN_OK","connectionId":"c1"}"#);

        let json = ControlMessage::binary("c1", b"hi".to_vec()).to_json().unwrap();
        assert_eq!(json, r#"{"type":"BINARY","connectionId":"c1","data":"aGk="}"#);
    }

    #[test]
    fn test_parse_request_with_body() {
        let text = r#"{"type":"REQUEST","id":"r1","method":"POST","path":"/api",
            "query":"a=1","headers":[["Content-Type","text/plain"]],"body":"aGVsbG8="}"#;
        match ControlMessage::from_json(text).unwrap() {
            ControlMessage::Request(req) => {
                assert_eq!(req.id.as_deref(), Some("r1"));
                assert_eq!(req.query.as_deref(), Some("a=1"));
                assert_eq!(req.headers[0].0, "Content-Type");
                assert_eq!(req.body.as_deref(), Some(&b"hello"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_without_code() {
        let msg = ControlMessage::from_json(r#"{"type":"CLOSE","connectionId":"x"}"#).unwrap();
        assert_eq!(msg, ControlMessage::close("x"));
        assert_eq!(msg.connection_id(), Some("x"));
    }

    #[test]
    fn test_response_without_body() {
        let msg = ControlMessage::from_json(r#"{"type":"RESPONSE","id":"r1","status":204}"#)
            .unwrap();
        match msg {
            ControlMessage::Response(resp) => {
                assert_eq!(resp.status, 204);
                assert!(resp.body.is_none());
                assert!(resp.headers.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(ControlMessage::from_json(r#"{"type":"PING"}"#).is_err());
        assert!(ControlMessage::from_json(r#"{"type":"BINARY","connectionId":"c","data":"***"}"#).is_err());
        assert!(ControlMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_reserved_close_codes_are_not_sent() {
        assert_eq!(sendable_close_code(Some(1006)), CLOSE_NORMAL);
        assert_eq!(sendable_close_code(None), CLOSE_NORMAL);
        assert_eq!(sendable_close_code(Some(4001)), 4001);
        assert_eq!(sendable_close_code(Some(CLOSE_GOING_AWAY)), CLOSE_GOING_AWAY);
    }

    #[test]
    fn test_bad_gateway_body() {
        let resp = HttpResponse::bad_gateway("r9", "connection refused");
        assert_eq!(resp.status, 502);
        assert_eq!(resp.body.unwrap(), b"Bad Gateway: connection refused");
    }
}
