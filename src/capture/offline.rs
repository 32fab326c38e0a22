//! Offline capture ingest: PCAP/PCAPNG byte streams in, packet records and
//! per-stream summaries out.
//!
//! The byte stream is spooled to a temporary file and replayed through the
//! same dissection pipeline as live capture, minus PID attribution.
//! Timestamps are rendered relative to the first packet as
//! `<seconds>.<micros>`.

use std::collections::HashMap;
use std::io::Write;

use pcap::Capture;
use serde::Serialize;

use crate::capture::pipeline::{parse_frame, DissectionPipeline};
use crate::config;
use crate::error::AppError;
use crate::record::{PacketRecord, TransportLayer};

/// One endpoint of a summarized stream.
#[derive(Debug, Clone, Serialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

/// One packet inside a stream summary.
#[derive(Debug, Clone, Serialize)]
pub struct StreamPacketSummary {
    pub id: u64,
    /// 0 when sent by `peers[0]`, 1 when sent by `peers[1]`.
    pub peer: u8,
    pub timestamp: String,
    pub payload_size: usize,
    pub payload_base64: String,
}

/// Summary of one reconstructed TCP stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub stream_id: u64,
    /// Canonically ordered endpoint pair; `peer` bits index into this.
    pub peers: [PeerAddr; 2],
    pub packet_count: u64,
    pub total_bytes: u64,
    pub packets: Vec<StreamPacketSummary>,
}

/// Result of one offline ingest.
#[derive(Debug, Serialize)]
pub struct OfflineCapture {
    pub packets: Vec<PacketRecord>,
    pub streams: Vec<StreamSummary>,
}

/// Ingest a PCAP or PCAPNG byte stream.
pub fn ingest_bytes(data: &[u8]) -> Result<OfflineCapture, AppError> {
    let mut spool = tempfile::NamedTempFile::new()?;
    spool.write_all(data)?;
    spool.flush()?;

    let mut cap = Capture::from_file(spool.path())
        .map_err(|e| AppError::Decode(format!("unreadable capture file: {e}")))?;

    let mut pipeline = DissectionPipeline::new(config::DEFAULT_DB_PORTS);
    let mut packets = Vec::new();
    let mut per_stream: HashMap<u64, Vec<StreamPacketSummary>> = HashMap::new();
    let mut first_ts: Option<f64> = None;

    loop {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(AppError::Decode(format!("capture read failed: {e}"))),
        };

        let ts = packet.header.ts.tv_sec as f64 + packet.header.ts.tv_usec as f64 / 1e6;
        let first = *first_ts.get_or_insert(ts);
        let timestamp = format_relative(ts - first);

        let Some(frame) = parse_frame(packet.data) else {
            tracing::debug!("Undecodable frame in capture file, skipped");
            continue;
        };

        let record = pipeline.process(&frame, ts, timestamp, None);
        if let (Some(stream_id), Some(peer)) = (record.stream_id, record.stream_peer) {
            let payload_size = match &record.transport {
                TransportLayer::Tcp { tcp } => tcp.payload_len,
                _ => 0,
            };
            per_stream.entry(stream_id).or_default().push(StreamPacketSummary {
                id: record.id,
                peer,
                timestamp: record.timestamp.clone(),
                payload_size,
                payload_base64: record.payload.base64.clone(),
            });
        }
        packets.push(record);
    }

    let mut streams: Vec<StreamSummary> = pipeline
        .streams
        .streams()
        .map(|s| {
            let mut endpoints = [s.initiator, s.responder];
            endpoints.sort();
            StreamSummary {
                stream_id: s.stream_id,
                peers: endpoints.map(|(ip, port)| PeerAddr {
                    host: ip.to_string(),
                    port,
                }),
                packet_count: s.total_packets,
                total_bytes: s.total_bytes,
                packets: per_stream.remove(&s.stream_id).unwrap_or_default(),
            }
        })
        .collect();
    streams.sort_by_key(|s| s.stream_id);

    tracing::info!(
        "Offline ingest: {} packets, {} streams",
        packets.len(),
        streams.len()
    );
    Ok(OfflineCapture { packets, streams })
}

/// Render a first-packet-relative timestamp as `<seconds>.<micros>`.
fn format_relative(rel: f64) -> String {
    let total_micros = (rel.max(0.0) * 1e6).round() as u64;
    format!("{}.{:06}", total_micros / 1_000_000, total_micros % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pipeline::build_tcp_frame;
    use crate::core::tcp_stream::TcpFlags;

    /// Assemble a little-endian PCAP file from (timestamp, frame) pairs.
    fn build_pcap(frames: &[(f64, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes()); // magic
        out.extend_from_slice(&2u16.to_le_bytes()); // version major
        out.extend_from_slice(&4u16.to_le_bytes()); // version minor
        out.extend_from_slice(&0i32.to_le_bytes()); // timezone offset
        out.extend_from_slice(&0u32.to_le_bytes()); // timestamp accuracy
        out.extend_from_slice(&65535u32.to_le_bytes()); // snapshot length
        out.extend_from_slice(&1u32.to_le_bytes()); // link type: Ethernet

        for (ts, frame) in frames {
            let secs = ts.trunc() as u32;
            let micros = (ts.fract() * 1e6).round() as u32;
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&micros.to_le_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(frame);
        }
        out
    }

    const SRC: [u8; 4] = [10, 0, 0, 1];
    const DST: [u8; 4] = [10, 0, 0, 2];

    #[test]
    fn test_ingest_reconstructs_stream() {
        let flags = TcpFlags::ACK | TcpFlags::PSH;
        let pcap_bytes = build_pcap(&[
            (
                1000.0,
                build_tcp_frame(SRC, DST, 40000, 80, 1, flags, b"ping"),
            ),
            (
                1000.5,
                build_tcp_frame(DST, SRC, 80, 40000, 1, flags, b"pong!"),
            ),
        ]);

        let result = ingest_bytes(&pcap_bytes).expect("valid pcap");
        assert_eq!(result.packets.len(), 2);
        assert_eq!(result.streams.len(), 1);

        // Relative timestamps, first packet at zero.
        assert_eq!(result.packets[0].timestamp, "0.000000");
        assert_eq!(result.packets[1].timestamp, "0.500000");

        let stream = &result.streams[0];
        assert_eq!(stream.packet_count, 2);
        assert_eq!(stream.total_bytes, 9);
        assert_eq!(stream.packets.len(), 2);
        assert_eq!(stream.packets[0].payload_size, 4);
        assert_eq!(stream.packets[1].payload_size, 5);
        assert_ne!(stream.packets[0].peer, stream.packets[1].peer);

        // Peers are canonically ordered and the peer bit indexes into them.
        assert_eq!(stream.peers[0].host, "10.0.0.1");
        assert_eq!(stream.peers[0].port, 40000);
        assert_eq!(stream.peers[1].host, "10.0.0.2");
        assert_eq!(stream.peers[1].port, 80);
    }

    #[test]
    fn test_ingest_rejects_garbage() {
        let err = ingest_bytes(b"definitely not a pcap").unwrap_err();
        assert_eq!(err.kind(), "Decode");
    }

    #[test]
    fn test_ingest_empty_capture() {
        let pcap_bytes = build_pcap(&[]);
        let result = ingest_bytes(&pcap_bytes).expect("empty pcap is valid");
        assert!(result.packets.is_empty());
        assert!(result.streams.is_empty());
    }

    #[test]
    fn test_format_relative() {
        assert_eq!(format_relative(0.0), "0.000000");
        assert_eq!(format_relative(1.25), "1.250000");
        assert_eq!(format_relative(0.000001), "0.000001");
        assert_eq!(format_relative(12.3456789), "12.345679");
    }
}
