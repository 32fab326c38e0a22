//! Maps network ports to owning process IDs from the OS inet-socket table.
//!
//! Each `refresh()` builds an immutable [`PortSnapshot`] and swaps it in
//! atomically; lookups run against whatever snapshot is current. On Linux the
//! table is assembled from `/proc/net/{tcp,tcp6,udp,udp6}` joined with each
//! process's fd → socket-inode links.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// One row of the OS socket table that could be attributed to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub pid: u32,
}

/// Immutable port → PID index built from one enumeration of the socket table.
#[derive(Debug, Default)]
pub struct PortSnapshot {
    generation: u64,
    port_to_pid: HashMap<u16, u32>,
    pid_to_ports: HashMap<u32, HashSet<u16>>,
    pid_to_addrs: HashMap<u32, HashSet<IpAddr>>,
}

impl PortSnapshot {
    /// Build a snapshot from attributable socket entries.
    pub fn from_entries(generation: u64, entries: impl IntoIterator<Item = SocketEntry>) -> Self {
        let mut snap = PortSnapshot {
            generation,
            ..Default::default()
        };
        for entry in entries {
            snap.port_to_pid.insert(entry.local_port, entry.pid);
            snap.pid_to_ports
                .entry(entry.pid)
                .or_default()
                .insert(entry.local_port);
            snap.pid_to_addrs
                .entry(entry.pid)
                .or_default()
                .insert(entry.local_ip);
        }
        snap
    }

    fn empty(generation: u64) -> Self {
        PortSnapshot {
            generation,
            ..Default::default()
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid_of(&self, port: u16) -> Option<u32> {
        self.port_to_pid.get(&port).copied()
    }

    pub fn ports_of(&self, pid: u32) -> HashSet<u16> {
        self.pid_to_ports.get(&pid).cloned().unwrap_or_default()
    }

    /// Local addresses bound by the process's sockets, for local-IP detection.
    pub fn addrs_of(&self, pid: u32) -> Vec<IpAddr> {
        self.pid_to_addrs
            .get(&pid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn belongs_to(&self, port: u16, pid: u32) -> bool {
        self.pid_of(port) == Some(pid)
    }

    pub fn len(&self) -> usize {
        self.port_to_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.port_to_pid.is_empty()
    }

    /// Mapping equality, ignoring the generation counter.
    pub fn same_mapping(&self, other: &PortSnapshot) -> bool {
        self.port_to_pid == other.port_to_pid && self.pid_to_ports == other.pid_to_ports
    }
}

/// Port → PID resolver with explicit refresh.
///
/// Refresh failures (typically permissions) are logged and install an empty
/// snapshot; callers must tolerate a missing port. Never fatal.
pub struct PortMapper {
    snapshot: RwLock<Arc<PortSnapshot>>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(PortSnapshot::empty(0))),
        }
    }

    /// Rebuild the mapping from the OS socket table and swap it in.
    pub fn refresh(&self) {
        let generation = self.snapshot().generation() + 1;
        let next = match enumerate_sockets() {
            Ok(entries) => {
                let snap = PortSnapshot::from_entries(generation, entries);
                tracing::info!("Port mapping refreshed: {} active ports", snap.len());
                snap
            }
            Err(e) => {
                tracing::warn!("Failed to enumerate socket table: {e:#}");
                PortSnapshot::empty(generation)
            }
        };
        *self.snapshot.write().unwrap() = Arc::new(next);
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<PortSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    pub fn pid_of(&self, port: u16) -> Option<u32> {
        self.snapshot().pid_of(port)
    }

    pub fn ports_of(&self, pid: u32) -> HashSet<u16> {
        self.snapshot().ports_of(pid)
    }

    pub fn belongs_to(&self, port: u16, pid: u32) -> bool {
        self.snapshot().belongs_to(port, pid)
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    #[cfg(test)]
    pub(crate) fn install(&self, entries: Vec<SocketEntry>) {
        let generation = self.snapshot().generation() + 1;
        *self.snapshot.write().unwrap() = Arc::new(PortSnapshot::from_entries(generation, entries));
    }
}

impl Default for PortMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerate attributable inet sockets: rows with a local address whose inode
/// maps to a process fd.
#[cfg(target_os = "linux")]
fn enumerate_sockets() -> anyhow::Result<Vec<SocketEntry>> {
    use anyhow::Context;

    let mut inode_to_pid: HashMap<u64, u32> = HashMap::new();
    let processes = procfs::process::all_processes().context("listing /proc")?;
    for proc in processes.flatten() {
        let pid = proc.pid as u32;
        // Unreadable fd tables (other users' processes) are skipped, not fatal.
        let Ok(fds) = proc.fd() else { continue };
        for fd in fds.flatten() {
            if let procfs::process::FDTarget::Socket(inode) = fd.target {
                inode_to_pid.insert(inode, pid);
            }
        }
    }

    let mut rows: Vec<(std::net::SocketAddr, u64)> = Vec::new();
    rows.extend(
        procfs::net::tcp()
            .context("/proc/net/tcp")?
            .into_iter()
            .map(|r| (r.local_address, r.inode)),
    );
    rows.extend(
        procfs::net::tcp6()
            .context("/proc/net/tcp6")?
            .into_iter()
            .map(|r| (r.local_address, r.inode)),
    );
    rows.extend(
        procfs::net::udp()
            .context("/proc/net/udp")?
            .into_iter()
            .map(|r| (r.local_address, r.inode)),
    );
    rows.extend(
        procfs::net::udp6()
            .context("/proc/net/udp6")?
            .into_iter()
            .map(|r| (r.local_address, r.inode)),
    );

    let entries = rows
        .into_iter()
        .filter_map(|(local, inode)| {
            inode_to_pid.get(&inode).map(|&pid| SocketEntry {
                local_ip: local.ip(),
                local_port: local.port(),
                pid,
            })
        })
        .collect();

    Ok(entries)
}

#[cfg(not(target_os = "linux"))]
fn enumerate_sockets() -> anyhow::Result<Vec<SocketEntry>> {
    // Socket-table attribution is Linux-only; other platforms run with an
    // empty snapshot and rely on IP-based matching in the capture engine.
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ip: &str, port: u16, pid: u32) -> SocketEntry {
        SocketEntry {
            local_ip: ip.parse().unwrap(),
            local_port: port,
            pid,
        }
    }

    #[test]
    fn test_snapshot_indexes_both_directions() {
        let snap = PortSnapshot::from_entries(
            1,
            vec![
                entry("192.168.1.5", 50000, 1234),
                entry("192.168.1.5", 50001, 1234),
                entry("0.0.0.0", 8080, 999),
            ],
        );
        assert_eq!(snap.pid_of(50000), Some(1234));
        assert_eq!(snap.pid_of(8080), Some(999));
        assert_eq!(snap.pid_of(1), None);

        let ports = snap.ports_of(1234);
        assert!(ports.contains(&50000) && ports.contains(&50001));
        assert_eq!(ports.len(), 2);
        assert!(snap.ports_of(42).is_empty());
    }

    #[test]
    fn test_belongs_to() {
        let snap = PortSnapshot::from_entries(1, vec![entry("10.0.0.1", 443, 77)]);
        assert!(snap.belongs_to(443, 77));
        assert!(!snap.belongs_to(443, 78));
        assert!(!snap.belongs_to(444, 77));
    }

    #[test]
    fn test_addrs_of_collects_local_ips() {
        let snap = PortSnapshot::from_entries(
            1,
            vec![
                entry("192.168.1.5", 50000, 1234),
                entry("127.0.0.1", 50002, 1234),
            ],
        );
        let addrs = snap.addrs_of(1234);
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&"192.168.1.5".parse().unwrap()));
    }

    #[test]
    fn test_refresh_is_idempotent_on_mapping() {
        // Building two snapshots from identical entries yields equal mappings
        // even though the generation advances.
        let rows = vec![entry("10.0.0.1", 80, 1), entry("10.0.0.1", 81, 2)];
        let a = PortSnapshot::from_entries(1, rows.clone());
        let b = PortSnapshot::from_entries(2, rows);
        assert!(a.same_mapping(&b));
        assert_ne!(a.generation(), b.generation());
    }

    #[test]
    fn test_mapper_swaps_snapshots() {
        let mapper = PortMapper::new();
        assert_eq!(mapper.generation(), 0);
        assert_eq!(mapper.pid_of(80), None);

        mapper.install(vec![entry("10.0.0.1", 80, 5)]);
        assert_eq!(mapper.generation(), 1);
        assert_eq!(mapper.pid_of(80), Some(5));

        // Old snapshots stay immutable after a swap.
        let old = mapper.snapshot();
        mapper.install(vec![]);
        assert_eq!(old.pid_of(80), Some(5));
        assert_eq!(mapper.pid_of(80), None);
    }

    #[test]
    fn test_missing_port_tolerated() {
        let mapper = PortMapper::new();
        assert!(!mapper.belongs_to(9999, 1));
        assert!(mapper.ports_of(1).is_empty());
    }
}
