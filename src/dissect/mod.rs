//! Layered protocol dissection: TCP flag summaries, TLS record views, HTTP
//! reassembly, and shallow port-based identification.

pub mod http;
pub mod tls;

use crate::core::tcp_stream::TcpFlags;
use crate::record::AppProtocol;

/// Wireshark-style summary line for a plain TCP segment:
/// `"<sport> → <dport> [FLAGS] Seq=N Ack=M Len=K"`.
pub fn tcp_info_line(
    sport: u16,
    dport: u16,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload_len: usize,
) -> String {
    let mut parts = vec![format!("{sport} → {dport}")];
    let names = flags.names();
    if !names.is_empty() {
        parts.push(format!("[{}]", names.join(", ")));
    }
    parts.push(format!("Seq={seq}"));
    if flags.ack() {
        parts.push(format!("Ack={ack}"));
    }
    parts.push(format!("Len={payload_len}"));
    parts.join(" ")
}

/// Summary line for a recognized TLS record.
pub fn tls_info_line(sport: u16, dport: u16, view: &tls::TlsRecordView) -> String {
    let mut parts = vec![format!("{sport} → {dport}")];
    match view.handshake_type {
        Some(ht) => {
            parts.push(ht.name().to_string());
            if let Some(sni) = &view.sni {
                parts.push(format!("SNI={sni}"));
            }
        }
        None => {
            parts.push(view.content_type.name().to_string());
            if view.content_type == tls::ContentType::ApplicationData {
                parts.push(format!("Len={}", view.record_length));
            }
        }
    }
    parts.join(" ")
}

/// Shallow application-protocol identification from well-known ports, used
/// when neither HTTP nor TLS matched the payload.
pub fn identify_by_port(sport: u16, dport: u16) -> Option<AppProtocol> {
    for port in [dport, sport] {
        let app = match port {
            53 => Some(AppProtocol::Dns),
            22 => Some(AppProtocol::Ssh),
            3306 => Some(AppProtocol::Mysql),
            6379 => Some(AppProtocol::Redis),
            _ => None,
        };
        if app.is_some() {
            return app;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_info_line_with_ack() {
        let flags = TcpFlags::from_bits(TcpFlags::PSH | TcpFlags::ACK);
        let line = tcp_info_line(50000, 443, flags, 1000, 2000, 120);
        assert_eq!(line, "50000 → 443 [ACK, PSH] Seq=1000 Ack=2000 Len=120");
    }

    #[test]
    fn test_tcp_info_line_syn_only() {
        let flags = TcpFlags::from_bits(TcpFlags::SYN);
        let line = tcp_info_line(50000, 80, flags, 0, 0, 0);
        assert_eq!(line, "50000 → 80 [SYN] Seq=0 Len=0");
    }

    #[test]
    fn test_tls_info_line_client_hello() {
        let hello = tls::client_hello_with_sni("api.example.com");
        let view = tls::parse_record(&hello).unwrap();
        let line = tls_info_line(50000, 443, &view);
        assert_eq!(line, "50000 → 443 Client Hello SNI=api.example.com");
    }

    #[test]
    fn test_tls_info_line_application_data() {
        let data = [0x17, 0x03, 0x03, 0x01, 0x00, 0xAA];
        let view = tls::parse_record(&data).unwrap();
        let line = tls_info_line(50000, 443, &view);
        assert_eq!(line, "50000 → 443 Application Data Len=256");
    }

    #[test]
    fn test_identify_by_port() {
        assert_eq!(identify_by_port(50000, 53), Some(AppProtocol::Dns));
        assert_eq!(identify_by_port(22, 50000), Some(AppProtocol::Ssh));
        assert_eq!(identify_by_port(40000, 3306), Some(AppProtocol::Mysql));
        assert_eq!(identify_by_port(6379, 40000), Some(AppProtocol::Redis));
        assert_eq!(identify_by_port(40000, 8080), None);
    }
}
