//! Frame parsing and the per-packet dissection pipeline shared by live and
//! offline capture.
//!
//! Everything here is pure computation: the capture loop hands in raw frame
//! bytes and gets back a finished [`PacketRecord`].

use std::net::IpAddr;
use std::sync::Mutex;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use crate::config;
use crate::core::classifier::TrafficClassifier;
use crate::core::tcp_stream::{TcpFlags, TcpSegment, TcpStreamManager};
use crate::dissect;
use crate::dissect::http::HttpStreamParser;
use crate::record::{
    AppLayer, AppProtocol, HttpDirection, HttpMeta, PacketRecord, Payload, TcpMeta, TransportLayer,
    TransportProto, UdpMeta,
};

/// Transport view over one parsed frame.
#[derive(Debug)]
pub(crate) enum FrameTransport<'a> {
    Tcp {
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: &'a [u8],
    },
    Udp {
        sport: u16,
        dport: u16,
        length: u16,
        payload: &'a [u8],
    },
}

/// A decoded Ethernet/IP frame, borrowed from the capture buffer.
#[derive(Debug)]
pub(crate) struct ParsedFrame<'a> {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub transport: FrameTransport<'a>,
    pub frame_len: usize,
}

impl ParsedFrame<'_> {
    pub fn sport(&self) -> u16 {
        match self.transport {
            FrameTransport::Tcp { sport, .. } | FrameTransport::Udp { sport, .. } => sport,
        }
    }

    pub fn dport(&self) -> u16 {
        match self.transport {
            FrameTransport::Tcp { dport, .. } | FrameTransport::Udp { dport, .. } => dport,
        }
    }
}

/// Parse an Ethernet frame down to its TCP/UDP transport.
///
/// Non-IP frames and other transports yield `None`; truncated layers are
/// decode errors the caller logs at debug.
pub(crate) fn parse_frame(data: &[u8]) -> Option<ParsedFrame<'_>> {
    let eth = EthernetPacket::new(data)?;
    // Borrowed as `&data[..]` directly: pnet's generated `payload()` ties
    // its return lifetime to `&self` rather than the buffer it wraps, which
    // doesn't let the slice outlive the temporary `*Packet` view.
    let eth_payload = bounded_slice(data, EthernetPacket::minimum_packet_size(), data.len());
    match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(eth_payload)?;
            let src_ip = IpAddr::V4(ipv4.get_source());
            let dst_ip = IpAddr::V4(ipv4.get_destination());
            // The IP total length trims link-layer padding off the payload.
            let header_len = (ipv4.get_header_length() as usize) * 4;
            let ip_payload_len = (ipv4.get_total_length() as usize).checked_sub(header_len)?;
            let ip_payload = bounded_slice(eth_payload, header_len, header_len + ip_payload_len);
            parse_transport(
                ipv4.get_next_level_protocol(),
                ip_payload,
                ip_payload_len,
                src_ip,
                dst_ip,
                data.len(),
            )
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(eth_payload)?;
            let src_ip = IpAddr::V6(ipv6.get_source());
            let dst_ip = IpAddr::V6(ipv6.get_destination());
            let payload_len = ipv6.get_payload_length() as usize;
            let ip_payload = bounded_slice(eth_payload, 40, 40 + payload_len);
            parse_transport(
                ipv6.get_next_header(),
                ip_payload,
                payload_len,
                src_ip,
                dst_ip,
                data.len(),
            )
        }
        _ => None,
    }
}

/// Replicates the bounds-clamping `payload()` getters that pnet generates:
/// empty once `start` runs past the buffer, otherwise `[start, end)` capped
/// to the buffer's actual length.
fn bounded_slice(buf: &[u8], start: usize, end: usize) -> &[u8] {
    if buf.len() <= start {
        return &[];
    }
    &buf[start..end.min(buf.len())]
}

fn parse_transport(
    protocol: pnet::packet::ip::IpNextHeaderProtocol,
    ip_payload: &[u8],
    ip_payload_len: usize,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    frame_len: usize,
) -> Option<ParsedFrame<'_>> {
    let transport = match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ip_payload)?;
            let data_offset = (tcp.get_data_offset() as usize) * 4;
            let payload_len = ip_payload_len.checked_sub(data_offset)?;
            let full = &ip_payload[..ip_payload_len.min(ip_payload.len())];
            let payload = &full[data_offset.min(full.len())..];
            let payload = &payload[..payload_len.min(payload.len())];
            FrameTransport::Tcp {
                sport: tcp.get_source(),
                dport: tcp.get_destination(),
                seq: tcp.get_sequence(),
                ack: tcp.get_acknowledgement(),
                flags: TcpFlags::from_bits(tcp.get_flags() as u8),
                window: tcp.get_window(),
                payload,
            }
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ip_payload)?;
            let payload_len = (udp.get_length() as usize).saturating_sub(8);
            let payload = bounded_slice(ip_payload, 8, 8 + payload_len);
            FrameTransport::Udp {
                sport: udp.get_source(),
                dport: udp.get_destination(),
                length: udp.get_length(),
                payload,
            }
        }
        _ => return None,
    };

    Some(ParsedFrame {
        src_ip,
        dst_ip,
        transport,
        frame_len,
    })
}

/// Stream tracking, dissection, and record assembly for one capture session.
pub(crate) struct DissectionPipeline {
    classifier: TrafficClassifier,
    pub streams: TcpStreamManager,
    pub http: HttpStreamParser,
    /// Monotonic record ids, assigned under a lock.
    packet_counter: Mutex<u64>,
    packets_since_gc: u64,
}

impl DissectionPipeline {
    pub fn new(db_ports: &str) -> Self {
        Self {
            classifier: TrafficClassifier::new(db_ports),
            streams: TcpStreamManager::new(),
            http: HttpStreamParser::new(),
            packet_counter: Mutex::new(0),
            packets_since_gc: 0,
        }
    }

    fn next_id(&self) -> u64 {
        let mut counter = self.packet_counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    /// Run one attributed frame through stream tracking and dissection.
    ///
    /// `known_outbound` carries the capture engine's attribution verdict;
    /// offline ingest passes `None` and direction falls back to the stream's
    /// initiator.
    pub fn process(
        &mut self,
        frame: &ParsedFrame<'_>,
        ts: f64,
        timestamp: String,
        known_outbound: Option<bool>,
    ) -> PacketRecord {
        match frame.transport {
            FrameTransport::Tcp {
                sport,
                dport,
                seq,
                ack,
                flags,
                window,
                payload,
            } => {
                let seg = TcpSegment {
                    src: (frame.src_ip, sport),
                    dst: (frame.dst_ip, dport),
                    seq,
                    ack,
                    flags,
                    window,
                    payload,
                };
                let (stream, analysis) = self.streams.process(&seg, ts);
                let stream_id = analysis.stream_id;
                let is_outbound = known_outbound.unwrap_or(seg.src == stream.initiator);

                // Layered recognition: TLS on the raw segment, then HTTP over
                // the reassembly buffers.
                let tls = if payload.is_empty() {
                    None
                } else {
                    dissect::tls::parse_record(payload)
                };

                let mut http_meta = None;
                if tls.is_none() {
                    if !stream.outbound.lossy() && !stream.outbound.is_empty() {
                        if let Some((request, consumed)) =
                            self.http
                                .poll_request(stream.outbound.as_slice(), ts, stream_id)
                        {
                            stream.outbound.consume(consumed);
                            http_meta = Some(HttpMeta {
                                direction: HttpDirection::Request,
                                method: Some(request.method.clone()),
                                url: Some(request.url.clone()),
                                status: None,
                                reason: None,
                                headers: request.headers.clone(),
                                body: body_preview(&request.body),
                            });
                        }
                    }
                    if http_meta.is_none() && !stream.inbound.lossy() && !stream.inbound.is_empty()
                    {
                        if let Some((response, consumed, _txn)) =
                            self.http
                                .poll_response(stream.inbound.as_slice(), ts, stream_id)
                        {
                            stream.inbound.consume(consumed);
                            http_meta = Some(HttpMeta {
                                direction: HttpDirection::Response,
                                method: None,
                                url: None,
                                status: Some(response.status),
                                reason: Some(response.reason.clone()),
                                headers: response.headers.clone(),
                                body: body_preview(&response.body),
                            });
                        }
                    }
                }

                let app_protocol = if http_meta.is_some() {
                    Some(AppProtocol::Http)
                } else if let Some(view) = &tls {
                    Some(AppProtocol::Tls(view.version))
                } else {
                    dissect::identify_by_port(sport, dport)
                };

                let info = if let Some(meta) = &http_meta {
                    match meta.direction {
                        HttpDirection::Request => format!(
                            "{} {} HTTP/1.1",
                            meta.method.as_deref().unwrap_or(""),
                            meta.url.as_deref().unwrap_or("")
                        ),
                        HttpDirection::Response => format!(
                            "HTTP/1.1 {} {}",
                            meta.status.unwrap_or(0),
                            meta.reason.as_deref().unwrap_or("")
                        ),
                    }
                } else if let Some(view) = &tls {
                    dissect::tls_info_line(sport, dport, view)
                } else {
                    dissect::tcp_info_line(sport, dport, flags, seq, ack, payload.len())
                };

                let app = match (http_meta, tls) {
                    (Some(http), _) => Some(AppLayer::Http { http }),
                    (None, Some(view)) => Some(AppLayer::Tls { tls: view }),
                    (None, None) => None,
                };

                self.maybe_gc(ts);

                PacketRecord {
                    id: self.next_id(),
                    timestamp,
                    source_ip: frame.src_ip,
                    dest_ip: frame.dst_ip,
                    src_port: sport,
                    dst_port: dport,
                    protocol: TransportProto::Tcp,
                    app_protocol,
                    size: frame.frame_len,
                    category: self.classifier.classify(dport, is_outbound),
                    info,
                    payload: Payload::project(payload),
                    transport: TransportLayer::Tcp {
                        tcp: TcpMeta {
                            seq,
                            ack,
                            flags: flags.mnemonic(),
                            window,
                            payload_len: payload.len(),
                            is_retransmission: analysis.is_retransmission,
                            is_out_of_order: analysis.is_out_of_order,
                            stream_state: analysis.state.as_str().to_string(),
                        },
                    },
                    app,
                    stream_id: Some(stream_id),
                    stream_peer: Some(analysis.peer),
                }
            }
            FrameTransport::Udp {
                sport,
                dport,
                length,
                payload,
            } => {
                let is_outbound = known_outbound.unwrap_or(true);
                let app_protocol = dissect::identify_by_port(sport, dport);
                let info = match app_protocol {
                    Some(app) => format!("{sport} → {dport} {}", app.name()),
                    None => format!("{sport} → {dport} UDP Len={}", payload.len()),
                };

                PacketRecord {
                    id: self.next_id(),
                    timestamp,
                    source_ip: frame.src_ip,
                    dest_ip: frame.dst_ip,
                    src_port: sport,
                    dst_port: dport,
                    protocol: TransportProto::Udp,
                    app_protocol,
                    size: frame.frame_len,
                    category: self.classifier.classify(dport, is_outbound),
                    info,
                    payload: Payload::project(payload),
                    transport: TransportLayer::Udp {
                        udp: UdpMeta { length },
                    },
                    app: None,
                    stream_id: None,
                    stream_peer: None,
                }
            }
        }
    }

    /// Periodic stream-table GC, amortized over packet processing.
    fn maybe_gc(&mut self, now: f64) {
        self.packets_since_gc += 1;
        if self.packets_since_gc >= config::STREAM_GC_INTERVAL_PACKETS {
            self.packets_since_gc = 0;
            self.streams.gc_idle(now);
        }
    }
}

fn body_preview(body: &[u8]) -> String {
    let preview: String = String::from_utf8_lossy(body)
        .chars()
        .take(config::HTTP_BODY_PREVIEW_CAP)
        .collect();
    preview
}

/// Build an Ethernet+IPv4+TCP frame with the given payload. Test helper
/// shared across capture tests.
#[cfg(test)]
pub(crate) fn build_tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let ip_len = 20 + 20 + payload.len();
    let mut frame = Vec::new();
    // Ethernet header: dst MAC, src MAC, EtherType IPv4.
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&[0x08, 0x00]);
    // IPv4 header.
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&(ip_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // id + flags
    frame.push(64); // ttl
    frame.push(6); // protocol: TCP
    frame.extend_from_slice(&[0x00, 0x00]); // checksum
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    // TCP header.
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // ack
    frame.push(0x50); // data offset: 5 words
    frame.push(flags);
    frame.extend_from_slice(&1024u16.to_be_bytes()); // window
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // checksum + urgent
    frame.extend_from_slice(payload);
    frame
}

/// Build an Ethernet+IPv4+UDP frame. Test helper.
#[cfg(test)]
pub(crate) fn build_udp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&(ip_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    frame.push(64);
    frame.push(17); // protocol: UDP
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]); // checksum
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: [u8; 4] = [192, 168, 1, 10];
    const DST: [u8; 4] = [93, 184, 216, 34];

    #[test]
    fn test_parse_tcp_frame() {
        let frame = build_tcp_frame(SRC, DST, 50000, 80, 1000, TcpFlags::ACK, b"hello");
        let parsed = parse_frame(&frame).expect("valid TCP frame");
        assert_eq!(parsed.src_ip, IpAddr::from(SRC));
        assert_eq!(parsed.dst_ip, IpAddr::from(DST));
        match parsed.transport {
            FrameTransport::Tcp {
                sport,
                dport,
                seq,
                payload,
                ..
            } => {
                assert_eq!((sport, dport, seq), (50000, 80, 1000));
                assert_eq!(payload, b"hello");
            }
            _ => panic!("expected TCP"),
        }
    }

    #[test]
    fn test_parse_trims_ethernet_padding() {
        // Short frames are padded to 60 bytes on the wire; the IP total
        // length must win over the captured length.
        let mut frame = build_tcp_frame(SRC, DST, 50000, 80, 1, TcpFlags::ACK, b"");
        while frame.len() < 60 {
            frame.push(0xEE);
        }
        let parsed = parse_frame(&frame).unwrap();
        match parsed.transport {
            FrameTransport::Tcp { payload, .. } => assert!(payload.is_empty()),
            _ => panic!("expected TCP"),
        }
    }

    #[test]
    fn test_parse_udp_frame() {
        let frame = build_udp_frame(SRC, DST, 5353, 53, b"\x12\x34");
        let parsed = parse_frame(&frame).unwrap();
        match parsed.transport {
            FrameTransport::Udp {
                sport,
                dport,
                length,
                payload,
            } => {
                assert_eq!((sport, dport), (5353, 53));
                assert_eq!(length, 10);
                assert_eq!(payload, b"\x12\x34");
            }
            _ => panic!("expected UDP"),
        }
    }

    #[test]
    fn test_parse_rejects_non_ip() {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(parse_frame(&frame).is_none());
    }

    #[test]
    fn test_pipeline_emits_monotonic_ids_per_stream() {
        let mut pipeline = DissectionPipeline::new("3306");
        let mut last_id = 0;
        for i in 0..5u32 {
            let frame = build_tcp_frame(SRC, DST, 50000, 80, 1000 + i * 10, TcpFlags::ACK, b"0123456789");
            let parsed = parse_frame(&frame).unwrap();
            let rec = pipeline.process(&parsed, i as f64, format!("{i}.000000"), Some(true));
            assert!(rec.id > last_id, "ids must increase in emission order");
            last_id = rec.id;
            assert_eq!(rec.stream_id, Some(0));
            assert!(rec.is_consistent());
        }
    }

    #[test]
    fn test_pipeline_http_request_over_segments() {
        let mut pipeline = DissectionPipeline::new("3306");
        let wire = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (a, b) = wire.split_at(10);

        let f1 = build_tcp_frame(SRC, DST, 50000, 80, 1, TcpFlags::ACK, a);
        let parsed = parse_frame(&f1).unwrap();
        let rec = pipeline.process(&parsed, 0.0, "0.000000".into(), Some(true));
        assert!(rec.app.is_none(), "incomplete request not yet yielded");

        let f2 = build_tcp_frame(SRC, DST, 50000, 80, 11, TcpFlags::ACK, b);
        let parsed = parse_frame(&f2).unwrap();
        let rec = pipeline.process(&parsed, 0.1, "0.100000".into(), Some(true));
        assert_eq!(rec.app_protocol, Some(AppProtocol::Http));
        match rec.app {
            Some(AppLayer::Http { http }) => {
                assert_eq!(http.direction, HttpDirection::Request);
                assert_eq!(http.method.as_deref(), Some("POST"));
                assert_eq!(http.body, "hello");
            }
            other => panic!("expected HTTP layer, got {other:?}"),
        }
        assert_eq!(rec.info, "POST /x HTTP/1.1");

        // The consumed request left the outbound buffer empty.
        let ep_src = (IpAddr::from(SRC), 50000);
        let ep_dst = (IpAddr::from(DST), 80);
        let stream = pipeline.streams.get(ep_src, ep_dst).unwrap();
        assert!(stream.outbound.is_empty());
    }

    #[test]
    fn test_pipeline_tls_client_hello() {
        let mut pipeline = DissectionPipeline::new("");
        let hello = crate::dissect::tls::client_hello_with_sni("api.example.com");
        let frame = build_tcp_frame(SRC, DST, 50000, 443, 1, TcpFlags::ACK, &hello);
        let parsed = parse_frame(&frame).unwrap();
        let rec = pipeline.process(&parsed, 0.0, "0.000000".into(), Some(true));
        match rec.app {
            Some(AppLayer::Tls { tls }) => {
                assert_eq!(tls.sni.as_deref(), Some("api.example.com"));
            }
            other => panic!("expected TLS layer, got {other:?}"),
        }
        assert!(rec.info.contains("Client Hello"));
        assert!(rec.info.contains("SNI=api.example.com"));
    }

    #[test]
    fn test_pipeline_udp_dns_by_port() {
        let mut pipeline = DissectionPipeline::new("");
        let frame = build_udp_frame(SRC, [8, 8, 8, 8], 40000, 53, b"\x00\x01");
        let parsed = parse_frame(&frame).unwrap();
        let rec = pipeline.process(&parsed, 0.0, "0.000000".into(), Some(true));
        assert_eq!(rec.app_protocol, Some(AppProtocol::Dns));
        assert_eq!(rec.protocol, TransportProto::Udp);
        assert!(rec.stream_id.is_none());
        assert!(rec.is_consistent());
    }

    #[test]
    fn test_pipeline_db_category_wins() {
        let mut pipeline = DissectionPipeline::new("3306,6379");
        let frame = build_tcp_frame(SRC, DST, 50000, 3306, 1, TcpFlags::ACK, b"\x03SELECT 1");
        let parsed = parse_frame(&frame).unwrap();
        let rec = pipeline.process(&parsed, 0.0, "0.000000".into(), Some(true));
        assert_eq!(
            serde_json::to_value(rec.category).unwrap(),
            serde_json::json!("db")
        );
        assert_eq!(rec.app_protocol, Some(AppProtocol::Mysql));
    }
}
