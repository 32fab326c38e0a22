//! Centralized runtime constants for procshark.
//!
//! All tunable caps, intervals, and defaults are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.

/// Maximum bytes held per reassembly direction before the oldest prefix is
/// dropped and the direction is marked lossy.
pub const STREAM_BUFFER_CAP: usize = 1024 * 1024;

/// Maximum distinct sequence numbers remembered per stream for retransmission
/// detection; the oldest entry is evicted past this point.
pub const SEEN_SEQ_CAP: usize = 4096;

/// A repeated request to the same URL within this window is flagged as a retry (seconds).
pub const RETRY_WINDOW_SECS: f64 = 5.0;

/// Timestamps remembered per URL for retry detection.
pub const RETRY_HISTORY_CAP: usize = 10;

/// Completed passive HTTP transactions retained by the parser.
pub const TRANSACTION_HISTORY_CAP: usize = 1024;

/// Default bounded queue depth for a subscriber.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

/// CLOSED streams idle for longer than this are garbage-collected (seconds).
pub const STREAM_GC_IDLE_SECS: f64 = 300.0;

/// Packets processed between stream-table GC sweeps.
pub const STREAM_GC_INTERVAL_PACKETS: u64 = 1024;

/// Bounded join applied to the capture thread on `stop()` (milliseconds).
pub const CAPTURE_JOIN_TIMEOUT_MS: u64 = 2000;

/// Read timeout on the kernel sniff call, so the stop flag is polled (milliseconds).
pub const SNIFF_READ_TIMEOUT_MS: i32 = 100;

/// Database ports used by the classifier when a session supplies none.
pub const DEFAULT_DB_PORTS: &str = "3306,6379,5432";

/// Local IP used when auto-detection finds no candidate.
pub const DEFAULT_LOCAL_IP: &str = "192.168.2.130";

/// Raw payload bytes carried on a packet record before truncation.
pub const PAYLOAD_CAPTURE_CAP: usize = 1024;

/// Characters kept in the textual payload preview.
pub const PREVIEW_TEXT_CAP: usize = 500;

/// Payload bytes rendered in the hex projection.
pub const HEX_PROJECTION_CAP: usize = 128;

/// HTTP body bytes carried inline on a packet record.
pub const HTTP_BODY_PREVIEW_CAP: usize = 500;

/// Leaf certificates cached by the interception proxy.
pub const MITM_CERT_CACHE: u64 = 1000;
