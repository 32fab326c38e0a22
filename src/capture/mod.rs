//! Packet capture engines: live per-process sniffing and offline ingest.
//!
//! The live engine owns a dedicated OS thread for the blocking sniff call;
//! everything after the kernel read is pure computation. `stop()` is
//! idempotent and joins the thread with a bounded timeout. A `Drop` impl
//! flips the shutdown flag so capture resources are released on panic/exit.

pub mod offline;
pub(crate) mod pipeline;
mod sniff;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pcap::{Capture, Device};

use crate::config;
use crate::core::port_mapper::PortMapper;
use crate::core::process_scanner;
use crate::error::AppError;
use crate::fanout::PacketFeed;

/// Parameters for one live capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// The process whose traffic is captured.
    pub target_pid: u32,
    /// Comma-separated ports classified as database traffic.
    pub db_ports: String,
    /// When non-empty, the BPF filter is narrowed to these hosts.
    pub server_ips: Vec<IpAddr>,
    /// Capture device name; the default device is looked up when `None`.
    pub device: Option<String>,
    /// Local IP used when auto-detection finds no candidate.
    pub fallback_local_ip: IpAddr,
}

impl CaptureConfig {
    pub fn new(target_pid: u32) -> Self {
        Self {
            target_pid,
            db_ports: config::DEFAULT_DB_PORTS.to_string(),
            server_ips: Vec::new(),
            device: None,
            fallback_local_ip: config::DEFAULT_LOCAL_IP.parse().unwrap(),
        }
    }
}

/// Build the kernel filter: `(tcp or udp)`, AND-combined with a `host`
/// disjunction when server IPs are configured.
pub(crate) fn build_bpf(server_ips: &[IpAddr]) -> String {
    let base = "(tcp or udp)";
    if server_ips.is_empty() {
        return base.to_string();
    }
    let hosts = server_ips
        .iter()
        .map(|ip| format!("host {ip}"))
        .collect::<Vec<_>>()
        .join(" or ");
    format!("{base} and ({hosts})")
}

/// Manages a background live-capture thread for one session.
pub struct CaptureEngine {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureEngine {
    /// Validate the session, open the capture device, and start the sniff
    /// thread. An unknown PID or an unopenable device rejects the session.
    pub fn start(config: CaptureConfig, feed: Arc<PacketFeed>) -> Result<Self, AppError> {
        if !process_scanner::process_exists(config.target_pid) {
            return Err(AppError::InvalidInput(format!(
                "no such process: {}",
                config.target_pid
            )));
        }

        let device = match &config.device {
            Some(name) => Device::from(name.as_str()),
            None => Device::lookup()?
                .ok_or_else(|| AppError::Capture("no capture device available".into()))?,
        };
        let device_name = device.name.clone();

        let bpf = build_bpf(&config.server_ips);
        let mut cap = Capture::from_device(device)?
            .promisc(true)
            .snaplen(65535)
            .timeout(config::SNIFF_READ_TIMEOUT_MS)
            .open()?;
        cap.filter(&bpf, true)?;
        tracing::info!(
            "Capture opened on {device_name} for PID {} with filter: {bpf}",
            config.target_pid
        );

        let port_mapper = PortMapper::new();
        port_mapper.refresh();
        let target_ports = port_mapper.ports_of(config.target_pid);
        tracing::info!(
            "Target PID {} is using ports: {target_ports:?}",
            config.target_pid
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("procshark-sniff".into())
            .spawn(move || {
                sniff::run_sniff_loop(cap, config, port_mapper, feed, shutdown_clone);
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Signal the sniff loop to stop and join it with a bounded timeout.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let Some(thread) = self.thread.take() else {
            return;
        };

        let deadline = Instant::now() + Duration::from_millis(config::CAPTURE_JOIN_TIMEOUT_MS);
        while !thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if thread.is_finished() {
            let _ = thread.join();
            tracing::info!("Capture stopped");
        } else {
            // The kernel read timeout bounds how long this can persist; the
            // detached thread exits on its next poll of the flag.
            tracing::warn!("Capture thread did not stop within the join timeout");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
