//! The live sniff loop: PID attribution and per-packet dissection.
//!
//! Runs on the capture thread. The only blocking point is the kernel read;
//! dissection, stream tracking, and fan-out are synchronous and non-blocking.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pcap::{Active, Capture};

use crate::capture::pipeline::{parse_frame, DissectionPipeline, ParsedFrame};
use crate::capture::CaptureConfig;
use crate::core::port_mapper::{PortMapper, PortSnapshot};
use crate::fanout::{FeedEvent, PacketFeed};

/// A forward 5-tuple seen as outbound; reverse packets of these connections
/// are captured even when PID attribution fails on the return path.
type ConnKey = (IpAddr, u16, IpAddr, u16);

struct SniffState {
    config: CaptureConfig,
    port_mapper: PortMapper,
    pipeline: DissectionPipeline,
    feed: Arc<PacketFeed>,
    /// Detected once per session, then memoized.
    local_ip: Option<IpAddr>,
    known_connections: HashSet<ConnKey>,
}

/// Blocking capture loop. Returns when the shutdown flag is set or the sniff
/// backend fails; backend failures notify subscribers with an error frame.
pub(crate) fn run_sniff_loop(
    mut cap: Capture<Active>,
    config: CaptureConfig,
    port_mapper: PortMapper,
    feed: Arc<PacketFeed>,
    shutdown: Arc<AtomicBool>,
) {
    let mut state = SniffState {
        pipeline: DissectionPipeline::new(&config.db_ports),
        config,
        port_mapper,
        feed,
        local_ip: None,
        known_connections: HashSet::new(),
    };

    tracing::info!("Sniff loop started for PID {}", state.config.target_pid);

    while !shutdown.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(packet) => process_frame(&mut state, packet.data),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tracing::error!("Sniff backend error: {e}");
                state.feed.publish(FeedEvent::SessionError {
                    message: format!("capture session failed: {e}"),
                });
                break;
            }
        }
    }

    tracing::info!("Sniff loop stopped");
}

fn process_frame(state: &mut SniffState, data: &[u8]) {
    let Some(frame) = parse_frame(data) else {
        tracing::debug!("Undecodable frame ({}B), skipped", data.len());
        return;
    };

    let Some(is_outbound) = attribute(state, &frame) else {
        return;
    };

    let ts = epoch_now();
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    let record = state
        .pipeline
        .process(&frame, ts, timestamp, Some(is_outbound));
    state.feed.publish(FeedEvent::Packet(record));
}

/// Decide whether a frame belongs to the target process.
///
/// Returns the outbound verdict, or `None` to discard the packet silently.
/// A packet belongs when its source or destination port maps to the PID,
/// when either address is the detected local IP, or when it is the reverse
/// of a connection previously seen outbound.
fn attribute(state: &mut SniffState, frame: &ParsedFrame<'_>) -> Option<bool> {
    let snapshot = state.port_mapper.snapshot();
    let pid = state.config.target_pid;
    let (sport, dport) = (frame.sport(), frame.dport());

    let local_ip = *state.local_ip.get_or_insert_with(|| {
        let ip = detect_local_ip(pid, &snapshot, state.config.fallback_local_ip);
        tracing::info!("Local IP for PID {pid}: {ip}");
        ip
    });

    let is_outbound =
        snapshot.belongs_to(sport, pid) || frame.src_ip == local_ip;
    let mut is_inbound =
        snapshot.belongs_to(dport, pid) || frame.dst_ip == local_ip;

    let forward: ConnKey = (frame.src_ip, sport, frame.dst_ip, dport);
    let reverse: ConnKey = (frame.dst_ip, dport, frame.src_ip, sport);
    if is_outbound {
        state.known_connections.insert(forward);
    }
    if !is_inbound && state.known_connections.contains(&reverse) {
        is_inbound = true;
    }

    if is_outbound || is_inbound {
        Some(is_outbound)
    } else {
        None
    }
}

/// Pick the session's local IP from the target's bound sockets: skip
/// loopback and wildcard, prefer a 192.168.0.0/16 address, else take the
/// first candidate, else the configured fallback.
fn detect_local_ip(pid: u32, snapshot: &PortSnapshot, fallback: IpAddr) -> IpAddr {
    let candidates: Vec<IpAddr> = snapshot
        .addrs_of(pid)
        .into_iter()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect();

    candidates
        .iter()
        .find(|ip| is_private_192(ip))
        .or_else(|| candidates.first())
        .copied()
        .unwrap_or(fallback)
}

fn is_private_192(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.octets()[0] == 192 && v4.octets()[1] == 168)
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::port_mapper::SocketEntry;

    fn entry(ip: &str, port: u16, pid: u32) -> SocketEntry {
        SocketEntry {
            local_ip: ip.parse().unwrap(),
            local_port: port,
            pid,
        }
    }

    fn snapshot(entries: Vec<SocketEntry>) -> PortSnapshot {
        PortSnapshot::from_entries(1, entries)
    }

    const FALLBACK: &str = "192.168.2.130";

    #[test]
    fn test_detect_prefers_192_168() {
        let snap = snapshot(vec![
            entry("10.1.2.3", 1000, 7),
            entry("192.168.1.20", 1001, 7),
        ]);
        let ip = detect_local_ip(7, &snap, FALLBACK.parse().unwrap());
        assert_eq!(ip, "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_detect_skips_loopback_and_wildcard() {
        let snap = snapshot(vec![
            entry("127.0.0.1", 1000, 7),
            entry("0.0.0.0", 1001, 7),
            entry("10.1.2.3", 1002, 7),
        ]);
        let ip = detect_local_ip(7, &snap, FALLBACK.parse().unwrap());
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_detect_falls_back_when_no_candidates() {
        let snap = snapshot(vec![entry("127.0.0.1", 1000, 7)]);
        let ip = detect_local_ip(7, &snap, FALLBACK.parse().unwrap());
        assert_eq!(ip, FALLBACK.parse::<IpAddr>().unwrap());
    }

    fn sniff_state_with(entries: Vec<SocketEntry>, pid: u32) -> SniffState {
        let mapper = PortMapper::new();
        mapper.install(entries);
        let mut config = CaptureConfig::new(pid);
        config.fallback_local_ip = FALLBACK.parse().unwrap();
        SniffState {
            pipeline: DissectionPipeline::new(&config.db_ports),
            config,
            port_mapper: mapper,
            feed: Arc::new(PacketFeed::new()),
            local_ip: None,
            known_connections: HashSet::new(),
        }
    }

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        crate::capture::pipeline::build_tcp_frame(
            src,
            dst,
            sport,
            dport,
            1,
            crate::core::tcp_stream::TcpFlags::ACK,
            b"",
        )
    }

    #[test]
    fn test_attribute_by_source_port() {
        let mut state = sniff_state_with(vec![entry("10.0.0.5", 40000, 7)], 7);
        let frame_bytes = tcp_frame([10, 0, 0, 5], [1, 1, 1, 1], 40000, 443);
        let frame = parse_frame(&frame_bytes).unwrap();
        assert_eq!(attribute(&mut state, &frame), Some(true));
    }

    #[test]
    fn test_attribute_discards_unrelated() {
        let mut state = sniff_state_with(vec![entry("10.0.0.5", 40000, 7)], 7);
        let frame_bytes = tcp_frame([2, 2, 2, 2], [1, 1, 1, 1], 5555, 443);
        let frame = parse_frame(&frame_bytes).unwrap();
        assert_eq!(attribute(&mut state, &frame), None);
    }

    #[test]
    fn test_attribute_reverse_of_known_connection() {
        let mut state = sniff_state_with(vec![entry("10.0.0.5", 40000, 7)], 7);

        // Outbound first: the forward tuple lands in the sticky set.
        let out = tcp_frame([10, 0, 0, 5], [1, 1, 1, 1], 40000, 443);
        let frame = parse_frame(&out).unwrap();
        assert_eq!(attribute(&mut state, &frame), Some(true));

        // Drop the port mapping, as if the snapshot went stale.
        state.port_mapper.install(vec![]);
        state.local_ip = Some("203.0.113.9".parse().unwrap());

        // The reverse packet still belongs via connection tracking.
        let back = tcp_frame([1, 1, 1, 1], [10, 0, 0, 5], 443, 40000);
        let frame = parse_frame(&back).unwrap();
        assert_eq!(attribute(&mut state, &frame), Some(false));
    }

    #[test]
    fn test_attribute_by_local_ip_match() {
        let mut state = sniff_state_with(vec![entry("192.168.1.20", 40000, 7)], 7);
        // Different port than the mapped one, but the source is the local IP.
        let frame_bytes = tcp_frame([192, 168, 1, 20], [1, 1, 1, 1], 50123, 443);
        let frame = parse_frame(&frame_bytes).unwrap();
        assert_eq!(attribute(&mut state, &frame), Some(true));
    }
}
