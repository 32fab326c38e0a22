//! Running-process enumeration via `sysinfo`.
//!
//! Used to validate a session's target PID and to offer a pickable process
//! list to frontends.

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

/// Minimal process descriptor for target selection.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: String,
}

/// List running processes, sorted by lowercase name. Nameless entries and
/// PID 0 are skipped.
pub fn running_processes() -> Vec<ProcessInfo> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut processes: Vec<ProcessInfo> = sys
        .processes()
        .iter()
        .filter_map(|(pid, proc)| {
            let name = proc.name().to_string_lossy().to_string();
            if name.is_empty() || pid.as_u32() == 0 {
                return None;
            }
            Some(ProcessInfo {
                pid: pid.as_u32(),
                name,
                exe_path: proc
                    .exe()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            })
        })
        .collect();

    processes.sort_by_key(|p| p.name.to_lowercase());
    processes
}

/// Whether a process with the given PID currently exists.
pub fn process_exists(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(
        ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
        true,
    );
    sys.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_listed() {
        let me = std::process::id();
        let procs = running_processes();
        assert!(
            procs.iter().any(|p| p.pid == me),
            "current process should appear in the listing"
        );
    }

    #[test]
    fn test_listing_is_sorted_and_filtered() {
        let procs = running_processes();
        assert!(procs.iter().all(|p| p.pid != 0 && !p.name.is_empty()));
        let names: Vec<String> = procs.iter().map(|p| p.name.to_lowercase()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id()));
        // PIDs are bounded well below this on any real system.
        assert!(!process_exists(u32::MAX - 1));
    }
}
