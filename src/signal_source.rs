/// OS-level observation: sockets on the watched port and processes matching the
/// worker name, each annotated with a short-window CPU sample.
///
/// Snapshots are taken fresh on every call and never cached. Errors for a single
/// socket or process are swallowed by skipping that entry; when the facility as a
/// whole is unavailable the corresponding half of the snapshot is empty.
use crate::sockets::{self, TcpState};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One socket bound to the watched local port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub status: TcpState,
    pub pid: Option<u32>,
    pub local: SocketAddr,
    /// `None` for sockets without a peer (listening).
    pub remote: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortSnapshot {
    pub has_established: bool,
    pub has_any: bool,
    pub connections: Vec<Connection>,
}

impl PortSnapshot {
    pub fn from_connections(connections: Vec<Connection>) -> Self {
        Self {
            has_established: connections.iter().any(|c| c.status.is_established()),
            has_any: !connections.is_empty(),
            connections,
        }
    }

    pub fn established(&self) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(|c| c.status.is_established())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
}

/// Matching processes, ordered by pid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub processes: Vec<ProcessSample>,
}

impl ProcessSnapshot {
    pub fn new(mut processes: Vec<ProcessSample>) -> Self {
        processes.sort_by_key(|p| p.pid);
        processes.dedup_by_key(|p| p.pid);
        Self { processes }
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.processes.iter().map(|p| p.pid)
    }

    /// Highest CPU sample across all matching processes.
    pub fn max_cpu(&self) -> Option<f32> {
        self.processes
            .iter()
            .map(|p| p.cpu_percent)
            .fold(None, |acc, cpu| match acc {
                Some(m) if m >= cpu => Some(m),
                _ => Some(cpu),
            })
    }
}

/// Everything observed in one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub ports: PortSnapshot,
    pub processes: ProcessSnapshot,
}

/// Source of OS-level facts for the run detector.
pub trait SignalSource {
    fn snapshot(&mut self, port: u16, process_pattern: &str) -> Snapshot;
}

/// Case-insensitive substring match on a process name.
pub fn name_matches(name: &str, pattern: &str) -> bool {
    name.to_lowercase().contains(&pattern.to_lowercase())
}

/// Live system source backed by `sysinfo` for processes and the kernel socket table.
pub struct SystemSignalSource {
    sys: System,
    sample_window: Duration,
}

impl SystemSignalSource {
    pub fn new(sample_window: Duration) -> Self {
        Self {
            sys: System::new(),
            sample_window,
        }
    }

    fn port_snapshot(&self, port: u16) -> PortSnapshot {
        let connections = sockets::sockets_on_port(port)
            .into_iter()
            .map(|(entry, pid)| Connection {
                status: entry.state,
                pid,
                local: entry.local,
                remote: (!entry.remote.ip().is_unspecified() || entry.remote.port() != 0)
                    .then_some(entry.remote),
            })
            .collect();
        PortSnapshot::from_connections(connections)
    }

    fn process_snapshot(&mut self, pattern: &str) -> ProcessSnapshot {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);
        let matching: Vec<Pid> = self
            .sys
            .processes()
            .iter()
            .filter(|(_, p)| name_matches(&p.name().to_string_lossy(), pattern))
            .map(|(pid, _)| *pid)
            .collect();
        if matching.is_empty() {
            return ProcessSnapshot::default();
        }

        // Two refreshes bracket the window so the sample excludes older CPU time.
        std::thread::sleep(self.sample_window);
        self.sys.refresh_processes(ProcessesToUpdate::Some(&matching), true);

        let samples = matching
            .iter()
            .filter_map(|pid| {
                // Gone since enumeration
                let process = self.sys.process(*pid)?;
                Some(ProcessSample {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    cpu_percent: process.cpu_usage(),
                })
            })
            .collect();
        ProcessSnapshot::new(samples)
    }
}

impl SignalSource for SystemSignalSource {
    fn snapshot(&mut self, port: u16, process_pattern: &str) -> Snapshot {
        let ports = self.port_snapshot(port);
        let processes = self.process_snapshot(process_pattern);
        Snapshot { ports, processes }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn conn(status: TcpState, pid: Option<u32>) -> Connection {
        Connection {
            status,
            pid,
            local: "127.0.0.1:3000".parse().unwrap(),
            remote: Some("127.0.0.1:50000".parse().unwrap()),
        }
    }

    #[test]
    fn test_name_matches_case_insensitive_substring() {
        assert!(name_matches("MetaTester64.exe", "metatester64"));
        assert!(name_matches("metatester64", "METATESTER"));
        assert!(!name_matches("terminal64.exe", "metatester64"));
    }

    #[test]
    fn test_port_snapshot_flags() {
        let empty = PortSnapshot::from_connections(vec![]);
        assert!(!empty.has_any);
        assert!(!empty.has_established);

        let listening = PortSnapshot::from_connections(vec![conn(TcpState::Listen, None)]);
        assert!(listening.has_any);
        assert!(!listening.has_established);

        let live = PortSnapshot::from_connections(vec![
            conn(TcpState::Listen, None),
            conn(TcpState::Established, Some(500)),
        ]);
        assert!(live.has_established);
        assert_eq!(live.established().count(), 1);
    }

    #[test]
    fn test_process_snapshot_sorted_and_max_cpu() {
        let snap = ProcessSnapshot::new(vec![
            ProcessSample {
                pid: 9,
                name: "w".into(),
                cpu_percent: 3.0,
            },
            ProcessSample {
                pid: 2,
                name: "w".into(),
                cpu_percent: 41.5,
            },
        ]);
        assert_eq!(snap.pids().collect::<Vec<_>>(), vec![2, 9]);
        assert_eq!(snap.max_cpu(), Some(41.5));
        assert_eq!(ProcessSnapshot::default().max_cpu(), None);
    }

    #[test]
    fn test_system_source_unknown_pattern_is_empty() {
        let mut source = SystemSignalSource::new(Duration::from_millis(10));
        let snap = source.snapshot(1, "no-such-process-name-xyz-123");
        assert!(snap.processes.is_empty());
    }
}
