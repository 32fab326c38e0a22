//! The Packet Record: the unit emitted to feed subscribers.
//!
//! Transport and application layers are modeled as sum types and flattened
//! into the JSON object, so the wire format keeps the optional `tcp`/`udp`/
//! `http`/`tls` sub-objects consumers key on. Fields may be added over time;
//! existing fields are never removed or retyped.

use std::net::IpAddr;

use serde::Serialize;

use crate::config;
use crate::core::classifier::TrafficCategory;
use crate::dissect::http::Headers;
use crate::dissect::tls::TlsRecordView;

/// Transport protocol; always present, independent of whether an
/// application layer was also recognized (see `app_protocol`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportProto {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "IP")]
    Ip,
}

/// Application protocol recognized by the dissector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProtocol {
    Http,
    Tls(crate::dissect::tls::TlsVersion),
    Dns,
    Ssh,
    Mysql,
    Redis,
}

impl AppProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            AppProtocol::Http => "HTTP",
            AppProtocol::Tls(v) => v.name(),
            AppProtocol::Dns => "DNS",
            AppProtocol::Ssh => "SSH",
            AppProtocol::Mysql => "MySQL",
            AppProtocol::Redis => "Redis",
        }
    }
}

impl Serialize for AppProtocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Transport sub-record, present for exactly one transport layer.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TransportLayer {
    Tcp { tcp: TcpMeta },
    Udp { udp: UdpMeta },
    Ip {},
}

/// Per-segment TCP details, filled from the stream manager's analysis.
#[derive(Debug, Clone, Serialize)]
pub struct TcpMeta {
    pub seq: u32,
    pub ack: u32,
    /// Mnemonic set, e.g. `"SYN|ACK"`.
    pub flags: String,
    pub window: u16,
    pub payload_len: usize,
    pub is_retransmission: bool,
    pub is_out_of_order: bool,
    pub stream_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UdpMeta {
    pub length: u16,
}

/// Application sub-record, present when the dissector recognized one.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AppLayer {
    Http { http: HttpMeta },
    Tls { tls: TlsRecordView },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpDirection {
    Request,
    Response,
}

/// HTTP details attached to the packet that completed a message.
#[derive(Debug, Clone, Serialize)]
pub struct HttpMeta {
    pub direction: HttpDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub headers: Headers,
    /// Body preview, decoded lossily and truncated.
    pub body: String,
}

/// Which decoder produced the textual payload preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderUsed {
    Utf8,
    Latin1,
    Hex,
}

/// Payload projections carried on every record with a payload.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    /// Raw captured bytes (truncated); not part of the wire format.
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub preview: String,
    pub decoder: DecoderUsed,
    pub hex: String,
    pub base64: String,
}

impl Payload {
    /// Build all projections from a raw payload, applying the configured caps.
    pub fn project(data: &[u8]) -> Self {
        use base64::Engine as _;

        let raw: Vec<u8> = data
            .iter()
            .copied()
            .take(config::PAYLOAD_CAPTURE_CAP)
            .collect();
        let (preview, decoder) = decode_preview(&raw, config::PREVIEW_TEXT_CAP);
        let hex = raw
            .iter()
            .take(config::HEX_PROJECTION_CAP)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let base64 = base64::engine::general_purpose::STANDARD.encode(&raw);

        Self {
            raw,
            preview,
            decoder,
            hex,
            base64,
        }
    }

    pub fn empty() -> Self {
        Self {
            raw: Vec::new(),
            preview: String::new(),
            decoder: DecoderUsed::Utf8,
            hex: String::new(),
            base64: String::new(),
        }
    }
}

/// Decode a payload for display: UTF-8, then Latin-1, then hex.
///
/// A decoder is accepted when at least 70% of the decoded characters are
/// printable; the chosen decoder is returned so callers can assert on it.
pub fn decode_preview(data: &[u8], max_chars: usize) -> (String, DecoderUsed) {
    if data.is_empty() {
        return (String::new(), DecoderUsed::Utf8);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        if printable_ratio(text) > 0.7 {
            return (truncate_chars(text, max_chars), DecoderUsed::Utf8);
        }
    }

    let latin1: String = data.iter().map(|&b| b as char).collect();
    if printable_ratio(&latin1) > 0.7 {
        return (truncate_chars(&latin1, max_chars), DecoderUsed::Latin1);
    }

    let hex = data
        .iter()
        .take(config::HEX_PROJECTION_CAP)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    (format!("[Binary {}B] {hex}", data.len()), DecoderUsed::Hex)
}

fn printable_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\r' | '\n' | '\t'))
        .count();
    printable as f64 / text.chars().count() as f64
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

/// The unit emitted to subscribers for every captured packet.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    /// Monotonically increasing within a session.
    pub id: u64,
    /// `HH:MM:SS.mmm` for live capture, `<seconds>.<micros>` relative to the
    /// first packet for offline capture.
    pub timestamp: String,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Transport protocol name.
    pub protocol: TransportProto,
    /// Application protocol, when recognized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<AppProtocol>,
    /// Total frame size in bytes.
    pub size: usize,
    pub category: TrafficCategory,
    /// Human-readable summary line.
    pub info: String,
    pub payload: Payload,
    #[serde(flatten)]
    pub transport: TransportLayer,
    #[serde(flatten)]
    pub app: Option<AppLayer>,
    /// Set iff the packet belongs to a tracked TCP flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    /// 0 when the packet was sent by the canonical "min" endpoint, 1 otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_peer: Option<u8>,
}

impl PacketRecord {
    /// `stream_id` present ⇔ TCP layer present.
    pub fn is_consistent(&self) -> bool {
        matches!(self.transport, TransportLayer::Tcp { .. }) == self.stream_id.is_some()
    }
}
