//! TLS record recognition and Client Hello SNI extraction.
//!
//! A shallow, read-only view over the first bytes of a segment; no handshake
//! state is kept and nothing is decrypted.

use serde::Serialize;

/// TLS record content types accepted by the recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x14 => Some(ContentType::ChangeCipherSpec),
            0x15 => Some(ContentType::Alert),
            0x16 => Some(ContentType::Handshake),
            0x17 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentType::ChangeCipherSpec => "ChangeCipherSpec",
            ContentType::Alert => "Alert",
            ContentType::Handshake => "Handshake",
            ContentType::ApplicationData => "Application Data",
        }
    }
}

impl Serialize for ContentType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Protocol versions named by the record-layer version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Ssl30,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn from_bytes(major: u8, minor: u8) -> Option<Self> {
        match (major, minor) {
            (0x03, 0x00) => Some(TlsVersion::Ssl30),
            (0x03, 0x01) => Some(TlsVersion::Tls10),
            (0x03, 0x02) => Some(TlsVersion::Tls11),
            (0x03, 0x03) => Some(TlsVersion::Tls12),
            (0x03, 0x04) => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TlsVersion::Ssl30 => "SSL 3.0",
            TlsVersion::Tls10 => "TLS 1.0",
            TlsVersion::Tls11 => "TLS 1.1",
            TlsVersion::Tls12 => "TLS 1.2",
            TlsVersion::Tls13 => "TLS 1.3",
        }
    }
}

impl Serialize for TlsVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Handshake message type (record byte 5 when the content type is Handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeType(pub u8);

impl HandshakeType {
    pub const CLIENT_HELLO: HandshakeType = HandshakeType(0x01);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0x00 => "Hello Request",
            0x01 => "Client Hello",
            0x02 => "Server Hello",
            0x04 => "New Session Ticket",
            0x05 => "End of Early Data",
            0x08 => "Encrypted Extensions",
            0x0b => "Certificate",
            0x0c => "Server Key Exchange",
            0x0d => "Certificate Request",
            0x0e => "Server Hello Done",
            0x0f => "Certificate Verify",
            0x10 => "Client Key Exchange",
            0x14 => "Finished",
            _ => "Unknown",
        }
    }
}

impl Serialize for HandshakeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Read-only projection of one TLS record.
#[derive(Debug, Clone, Serialize)]
pub struct TlsRecordView {
    pub version: TlsVersion,
    pub content_type: ContentType,
    pub record_length: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_type: Option<HandshakeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

/// Records longer than this cannot be legitimate TLS (16384 payload + 256
/// expansion allowance).
const MAX_RECORD_LENGTH: u16 = 16640;

/// Recognize a TLS record at the start of `payload`.
///
/// Acceptance requires, in order: at least 6 bytes; a known content type; a
/// `0x03 0x00..=0x04` version; a record length in `[1, 16640]`; and for
/// handshake records, a handshake type in `0x00..=0x14`. Anything else is not
/// TLS and returns `None`.
pub fn parse_record(payload: &[u8]) -> Option<TlsRecordView> {
    if payload.len() < 6 {
        return None;
    }

    let content_type = ContentType::from_byte(payload[0])?;
    let version = TlsVersion::from_bytes(payload[1], payload[2])?;

    let record_length = u16::from_be_bytes([payload[3], payload[4]]);
    if record_length < 1 || record_length > MAX_RECORD_LENGTH {
        return None;
    }

    let mut handshake_type = None;
    let mut sni = None;
    if content_type == ContentType::Handshake {
        let ht = payload[5];
        if ht > 0x14 {
            return None;
        }
        handshake_type = Some(HandshakeType(ht));
        if HandshakeType(ht) == HandshakeType::CLIENT_HELLO {
            sni = extract_sni(payload);
        }
    }

    Some(TlsRecordView {
        version,
        content_type,
        record_length,
        handshake_type,
        sni,
    })
}

/// Walk a Client Hello for the server_name extension.
///
/// Skips the fixed 43-byte prefix (record + handshake headers, client
/// version, random), then the length-prefixed session id, cipher suites, and
/// compression methods, and scans extensions for type `0x0000`. Any bound
/// violation aborts silently.
fn extract_sni(payload: &[u8]) -> Option<String> {
    if payload.len() < 43 {
        return None;
    }
    let mut offset = 43usize;

    // Session ID.
    let session_id_len = *payload.get(offset)? as usize;
    offset += 1 + session_id_len;

    // Cipher suites.
    let hi = *payload.get(offset)? as usize;
    let lo = *payload.get(offset + 1)? as usize;
    offset += 2 + ((hi << 8) | lo);

    // Compression methods.
    let compression_len = *payload.get(offset)? as usize;
    offset += 1 + compression_len;

    // Extensions block.
    let hi = *payload.get(offset)? as usize;
    let lo = *payload.get(offset + 1)? as usize;
    let extensions_len = (hi << 8) | lo;
    offset += 2;

    let end = offset + extensions_len;
    while offset + 4 <= end && offset + 4 <= payload.len() {
        let ext_type = ((payload[offset] as u16) << 8) | payload[offset + 1] as u16;
        let ext_len = ((payload[offset + 2] as usize) << 8) | payload[offset + 3] as usize;
        offset += 4;

        if ext_type == 0x0000 && ext_len > 5 {
            // SNI list length (2) + name type (1) + name length (2) + name.
            let name_type = *payload.get(offset + 2)?;
            let hi = *payload.get(offset + 3)? as usize;
            let lo = *payload.get(offset + 4)? as usize;
            let name_len = (hi << 8) | lo;
            if name_type == 0x00 && offset + 5 + name_len <= payload.len() {
                let name = &payload[offset + 5..offset + 5 + name_len];
                if name.is_ascii() {
                    return Some(String::from_utf8_lossy(name).into_owned());
                }
            }
            return None;
        }

        offset += ext_len;
    }

    None
}

/// Build a minimal Client Hello record carrying a single server_name
/// extension with the given host. Test helper shared across dissector tests.
#[cfg(test)]
pub(crate) fn client_hello_with_sni(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let sni_ext_payload_len = 2 + 1 + 2 + name.len(); // list len + type + name len + name
    let extensions_len = 4 + sni_ext_payload_len;

    let mut hello = Vec::new();
    // Record header; the length is backfilled below.
    hello.extend_from_slice(&[0x16, 0x03, 0x01, 0x00, 0x00]);
    // Handshake header: Client Hello, 3-byte length backfilled below.
    hello.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    // Client version + 32-byte random.
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0u8; 32]);
    // Session id (empty).
    hello.push(0x00);
    // Cipher suites: one suite.
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    // Compression methods: null only.
    hello.extend_from_slice(&[0x01, 0x00]);
    // Extensions.
    hello.extend_from_slice(&(extensions_len as u16).to_be_bytes());
    hello.extend_from_slice(&[0x00, 0x00]); // type: server_name
    hello.extend_from_slice(&(sni_ext_payload_len as u16).to_be_bytes());
    hello.extend_from_slice(&((1 + 2 + name.len()) as u16).to_be_bytes()); // SNI list length
    hello.push(0x00); // name type: host_name
    hello.extend_from_slice(&(name.len() as u16).to_be_bytes());
    hello.extend_from_slice(name);

    let record_len = (hello.len() - 5) as u16;
    hello[3..5].copy_from_slice(&record_len.to_be_bytes());
    let hs_len = (hello.len() - 9) as u32;
    hello[6..9].copy_from_slice(&hs_len.to_be_bytes()[1..]);
    hello
}
