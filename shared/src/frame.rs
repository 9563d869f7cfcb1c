//! Typed frames carried on the control link.
//!
//! Every message between server and client is one JSON frame, tagged by
//! `type`. Binary payloads travel base64-encoded. The codec knows nothing
//! about the transport; both ends feed it raw message bytes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum encoded frame size (16 MiB). Larger frames are rejected with a
/// typed error and the link is closed.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocols a tunnel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
    Tls,
    Udp,
}

impl TunnelProtocol {
    /// HTTP tunnels are hostname-routed; everything else owns a public port.
    pub fn needs_port(&self) -> bool {
        !matches!(self, TunnelProtocol::Http)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Tls => "tls",
            TunnelProtocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TunnelProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelProtocol::Http),
            "tcp" => Ok(TunnelProtocol::Tcp),
            "tls" => Ok(TunnelProtocol::Tls),
            "udp" => Ok(TunnelProtocol::Udp),
            other => Err(Error::Protocol(format!("unknown protocol: {other}"))),
        }
    }
}

/// A control-link frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every link, client to server.
    Init {
        protocol: TunnelProtocol,
        local_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        /// Requested subdomain, honored when free.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        /// Reattach to a paused tunnel owned by the same user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        /// Requested custom host, subject to policy.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        /// Skip reattach even when a paused record matches.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        force_new: bool,
    },

    /// Admission reply, server to client. Always the first server frame.
    TunnelCreated {
        tunnel_id: String,
        subdomain: String,
        public_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_port: Option<u16>,
        status: String,
    },

    /// Keepalive probe, server to client.
    Ping,
    /// Keepalive reply, client to server.
    Pong,

    /// One public HTTP request, server to client.
    HttpRequest {
        request_id: String,
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        headers: Vec<(String, String)>,
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        body: Option<Vec<u8>>,
    },

    /// The matching origin response, client to server.
    HttpResponse {
        request_id: String,
        status: u16,
        headers: Vec<(String, String)>,
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        body: Option<Vec<u8>>,
    },

    /// Origin failure for one request, client to server.
    HttpError { request_id: String, message: String },

    /// One chunk of a public TCP connection, either direction.
    TcpData {
        conn_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// EOF marker; an empty close frame ends one direction.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        close: bool,
    },

    /// TCP stream failure for one conn-id.
    TcpError { conn_id: String, message: String },

    /// One chunk of a passthrough TLS connection, either direction.
    TlsData {
        conn_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        close: bool,
    },

    /// TLS stream failure for one conn-id.
    TlsError { conn_id: String, message: String },

    /// One datagram, either direction, keyed by public source address.
    UdpData {
        addr: String,
        port: u16,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// UDP relay failure.
    UdpError { message: String },

    /// Client updates its claimed origin URL.
    UpdateTunnel { local_url: String },

    /// Server-side status change or typed error, server to client.
    TunnelStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Frame {
    /// Serialize to the wire representation.
    pub fn encode(&self) -> Result<String> {
        let text = serde_json::to_string(self)
            .map_err(|e| Error::Protocol(format!("frame encode: {e}")))?;
        if text.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    /// Parse a frame from raw message bytes.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("frame decode: {e}")))
    }

    /// Wire tag, for logging.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Init { .. } => "init",
            Frame::TunnelCreated { .. } => "tunnel_created",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::HttpRequest { .. } => "http_request",
            Frame::HttpResponse { .. } => "http_response",
            Frame::HttpError { .. } => "http_error",
            Frame::TcpData { .. } => "tcp_data",
            Frame::TcpError { .. } => "tcp_error",
            Frame::TlsData { .. } => "tls_data",
            Frame::TlsError { .. } => "tls_error",
            Frame::UdpData { .. } => "udp_data",
            Frame::UdpError { .. } => "udp_error",
            Frame::UpdateTunnel { .. } => "update_tunnel",
            Frame::TunnelStatus { .. } => "tunnel_status",
        }
    }

    /// Data frames may be dropped under write-pump backpressure; protocol
    /// frames never are.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Frame::TcpData { .. } | Frame::TlsData { .. } | Frame::UdpData { .. }
        )
    }
}

/// Base64 (de)serialization for required binary fields.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Base64 (de)serialization for optional binary fields.
mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&STANDARD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(de)?;
        match text {
            Some(t) => STANDARD.decode(t).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tag_and_defaults() {
        let json = r#"{"type":"init","protocol":"http","local_url":"http://localhost:3000"}"#;
        let frame = Frame::decode(json.as_bytes()).unwrap();
        match frame {
            Frame::Init {
                protocol,
                local_url,
                token,
                force_new,
                ..
            } => {
                assert_eq!(protocol, TunnelProtocol::Http);
                assert_eq!(local_url, "http://localhost:3000");
                assert!(token.is_none());
                assert!(!force_new);
            }
            other => panic!("wrong variant: {}", other.frame_type()),
        }
    }

    #[test]
    fn test_body_is_base64_on_the_wire() {
        let frame = Frame::HttpResponse {
            request_id: "r1".into(),
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: Some(b"pong".to_vec()),
        };
        let text = frame.encode().unwrap();
        assert!(text.contains(r#""type":"http_response""#));
        assert!(text.contains("cG9uZw=="));
        assert_eq!(Frame::decode(text.as_bytes()).unwrap(), frame);
    }

    #[test]
    fn test_close_flag_omitted_when_false() {
        let frame = Frame::TcpData {
            conn_id: "c1".into(),
            data: vec![],
            close: false,
        };
        let text = frame.encode().unwrap();
        assert!(!text.contains("close"));

        let eof = Frame::TcpData {
            conn_id: "c1".into(),
            data: vec![],
            close: true,
        };
        assert!(eof.encode().unwrap().contains(r#""close":true"#));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let huge = vec![b' '; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            Frame::decode(&huge),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = Frame::decode(br#"{"type":"warp_core"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TLS".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Tls);
        assert!(TunnelProtocol::Tcp.needs_port());
        assert!(!TunnelProtocol::Http.needs_port());
        assert!("quic".parse::<TunnelProtocol>().is_err());
    }

    #[test]
    fn test_udp_frame_carries_source() {
        let frame = Frame::UdpData {
            addr: "203.0.113.9".into(),
            port: 4242,
            data: vec![1, 2, 3],
        };
        let text = frame.encode().unwrap();
        let back = Frame::decode(text.as_bytes()).unwrap();
        assert_eq!(back, frame);
    }
}
