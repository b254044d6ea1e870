//! TCP socket table introspection.
//!
//! On Linux the kernel exposes the socket table as text in `/proc/net/tcp` and
//! `/proc/net/tcp6`. Each row carries the hex-encoded local and remote endpoint,
//! the connection state and the socket inode; the owning pid is found by
//! matching `socket:[inode]` links under `/proc/<pid>/fd`.
//!
//! On Windows the IP Helper owner-pid table (`GetExtendedTcpTable`) already
//! carries the owning pid, so no inode lookup is needed.
//!
//! Other platforms report an empty table.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

/// Kernel TCP connection states, as numbered in `include/net/tcp_states.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    NewSynRecv,
    Unknown,
}

impl TcpState {
    fn from_hex(code: &str) -> Self {
        match u8::from_str_radix(code, 16) {
            Ok(0x01) => TcpState::Established,
            Ok(0x02) => TcpState::SynSent,
            Ok(0x03) => TcpState::SynRecv,
            Ok(0x04) => TcpState::FinWait1,
            Ok(0x05) => TcpState::FinWait2,
            Ok(0x06) => TcpState::TimeWait,
            Ok(0x07) => TcpState::Close,
            Ok(0x08) => TcpState::CloseWait,
            Ok(0x09) => TcpState::LastAck,
            Ok(0x0A) => TcpState::Listen,
            Ok(0x0B) => TcpState::Closing,
            Ok(0x0C) => TcpState::NewSynRecv,
            _ => TcpState::Unknown,
        }
    }

    /// Map a Windows `MIB_TCP_STATE` value.
    pub fn from_mib(state: u32) -> Self {
        match state {
            1 => TcpState::Close,
            2 => TcpState::Listen,
            3 => TcpState::SynSent,
            4 => TcpState::SynRecv,
            5 => TcpState::Established,
            6 => TcpState::FinWait1,
            7 => TcpState::FinWait2,
            8 => TcpState::CloseWait,
            9 => TcpState::Closing,
            10 => TcpState::LastAck,
            11 => TcpState::TimeWait,
            // 12 is DELETE_TCB
            _ => TcpState::Unknown,
        }
    }

    pub fn is_established(self) -> bool {
        self == TcpState::Established
    }
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::Closing => "CLOSING",
            TcpState::NewSynRecv => "NEW_SYN_RECV",
            TcpState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One row of the kernel socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
    pub inode: u64,
}

/// Parse the contents of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// Malformed rows are skipped; the header row never parses.
pub fn parse_tcp_table(contents: &str, ipv6: bool) -> Vec<SocketEntry> {
    contents
        .lines()
        .filter_map(|line| parse_tcp_row(line, ipv6))
        .collect()
}

fn parse_tcp_row(line: &str, ipv6: bool) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // sl local rem st tx:rx tr:when retrnsmt uid timeout inode
    if fields.len() < 10 || !fields[0].ends_with(':') {
        return None;
    }
    let local = parse_endpoint(fields[1], ipv6)?;
    let remote = parse_endpoint(fields[2], ipv6)?;
    let state = TcpState::from_hex(fields[3]);
    let inode = fields[9].parse().ok()?;
    Some(SocketEntry {
        local,
        remote,
        state,
        inode,
    })
}

fn parse_endpoint(field: &str, ipv6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if ipv6 {
        parse_ipv6(addr_hex)?
    } else {
        parse_ipv4(addr_hex)?
    };
    Some(SocketAddr::new(ip, port))
}

// The kernel prints each 32-bit word in host byte order.
fn parse_ipv4(hex: &str) -> Option<IpAddr> {
    if hex.len() != 8 {
        return None;
    }
    let word = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(u32::from_be_bytes(
        word.to_ne_bytes(),
    ))))
}

fn parse_ipv6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 || !hex.is_ascii() {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

/// Extract the inode from an fd link target like `socket:[12345]`.
fn socket_inode(link: &Path) -> Option<u64> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Map each requested socket inode to the pid holding it open.
///
/// Processes that vanish or deny access mid-scan are skipped.
pub fn owners_of(proc_root: &Path, inodes: &[u64]) -> HashMap<u64, u32> {
    let mut owners = HashMap::new();
    if inodes.is_empty() {
        return owners;
    }

    let entries = match std::fs::read_dir(proc_root) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, root = %proc_root.display(), "cannot list process table");
            return owners;
        }
    };

    for entry in entries.flatten() {
        let pid: u32 = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            Some(p) => p,
            None => continue,
        };
        let fds = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(f) => f,
            Err(_) => continue,
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = socket_inode(&target) {
                if inodes.contains(&inode) {
                    owners.entry(inode).or_insert(pid);
                }
            }
        }
        if owners.len() == inodes.len() {
            break;
        }
    }
    owners
}

/// Read every TCP socket bound to `port` from the procfs tree at `proc_root`,
/// with owning pids where resolvable.
///
/// An unreadable table yields no entries.
pub fn proc_sockets_on_port(proc_root: &Path, port: u16) -> Vec<(SocketEntry, Option<u32>)> {
    let mut entries = Vec::new();
    for (name, ipv6) in [("tcp", false), ("tcp6", true)] {
        let path = proc_root.join("net").join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => entries.extend(
                parse_tcp_table(&contents, ipv6)
                    .into_iter()
                    .filter(|e| e.local.port() == port),
            ),
            Err(e) => {
                tracing::debug!(error = %e, path = %path.display(), "socket table unavailable")
            }
        }
    }
    if entries.is_empty() {
        return Vec::new();
    }

    let inodes: Vec<u64> = entries
        .iter()
        .map(|e| e.inode)
        .filter(|&inode| inode != 0)
        .collect();
    let owners = owners_of(proc_root, &inodes);
    entries
        .into_iter()
        .map(|e| {
            let pid = owners.get(&e.inode).copied();
            (e, pid)
        })
        .collect()
}

/// One row of the Windows owner-pid TCP table. Port words are passed through
/// as the IP Helper API returns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerPidRow {
    pub state: u32,
    pub local: IpAddr,
    pub local_port: u32,
    pub remote: IpAddr,
    pub remote_port: u32,
    pub pid: u32,
}

impl OwnerPidRow {
    pub fn into_entry(self) -> (SocketEntry, Option<u32>) {
        let entry = SocketEntry {
            local: SocketAddr::new(self.local, mib_port(self.local_port)),
            remote: SocketAddr::new(self.remote, mib_port(self.remote_port)),
            state: TcpState::from_mib(self.state),
            inode: 0,
        };
        // Pid 0 is the idle process, not an owner.
        (entry, (self.pid != 0).then_some(self.pid))
    }
}

/// The port sits in the low 16 bits of the DWORD, in network byte order.
pub fn mib_port(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

/// The DWORD's in-memory bytes are the address in network order.
pub fn mib_ipv4(raw: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(raw.to_ne_bytes()))
}

/// Read every TCP socket bound to `port`, with owning pids where resolvable.
#[cfg(target_os = "linux")]
pub fn sockets_on_port(port: u16) -> Vec<(SocketEntry, Option<u32>)> {
    proc_sockets_on_port(Path::new("/proc"), port)
}

/// Read every TCP socket bound to `port`, with owning pids where resolvable.
#[cfg(windows)]
pub fn sockets_on_port(port: u16) -> Vec<(SocketEntry, Option<u32>)> {
    iphelper::owner_pid_rows()
        .into_iter()
        .map(OwnerPidRow::into_entry)
        .filter(|(e, _)| e.local.port() == port)
        .collect()
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn sockets_on_port(_port: u16) -> Vec<(SocketEntry, Option<u32>)> {
    Vec::new()
}

#[cfg(windows)]
mod iphelper {
    use super::{mib_ipv4, OwnerPidRow};
    use std::net::{IpAddr, Ipv6Addr};
    use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, FALSE, NO_ERROR};
    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, MIB_TCP6ROW_OWNER_PID, MIB_TCP6TABLE_OWNER_PID,
        MIB_TCPROW_OWNER_PID, MIB_TCPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL,
    };
    use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

    /// The table can grow between the sizing call and the read.
    const ATTEMPTS: usize = 3;

    /// Fetch the raw owner-pid table for one address family into a
    /// DWORD-aligned buffer.
    fn owner_pid_table(family: u32) -> Option<Vec<u32>> {
        let mut size: u32 = 0;
        let mut buf: Vec<u32> = Vec::new();
        for _ in 0..ATTEMPTS {
            let ptr = if buf.is_empty() {
                None
            } else {
                Some(buf.as_mut_ptr().cast())
            };
            // SAFETY: whenever a pointer is passed, `buf` holds at least `size` bytes.
            let ret = unsafe {
                GetExtendedTcpTable(ptr, &mut size, FALSE, family, TCP_TABLE_OWNER_PID_ALL, 0)
            };
            if ret == NO_ERROR.0 && !buf.is_empty() {
                return Some(buf);
            }
            if ret != NO_ERROR.0 && ret != ERROR_INSUFFICIENT_BUFFER.0 {
                tracing::debug!(code = ret, family, "GetExtendedTcpTable failed");
                return None;
            }
            buf = vec![0u32; (size as usize).div_ceil(4)];
        }
        tracing::debug!(family, "socket table kept growing, giving up");
        None
    }

    pub(super) fn owner_pid_rows() -> Vec<OwnerPidRow> {
        let mut rows = Vec::new();

        if let Some(buf) = owner_pid_table(u32::from(AF_INET.0)) {
            let table = buf.as_ptr().cast::<MIB_TCPTABLE_OWNER_PID>();
            // SAFETY: the buffer was filled by GetExtendedTcpTable and holds
            // `dwNumEntries` rows after the header.
            let raw = unsafe {
                let first = std::ptr::addr_of!((*table).table).cast::<MIB_TCPROW_OWNER_PID>();
                std::slice::from_raw_parts(first, (*table).dwNumEntries as usize)
            };
            rows.extend(raw.iter().map(|r| OwnerPidRow {
                state: r.dwState,
                local: mib_ipv4(r.dwLocalAddr),
                local_port: r.dwLocalPort,
                remote: mib_ipv4(r.dwRemoteAddr),
                remote_port: r.dwRemotePort,
                pid: r.dwOwningPid,
            }));
        }

        if let Some(buf) = owner_pid_table(u32::from(AF_INET6.0)) {
            let table = buf.as_ptr().cast::<MIB_TCP6TABLE_OWNER_PID>();
            // SAFETY: as above.
            let raw = unsafe {
                let first = std::ptr::addr_of!((*table).table).cast::<MIB_TCP6ROW_OWNER_PID>();
                std::slice::from_raw_parts(first, (*table).dwNumEntries as usize)
            };
            rows.extend(raw.iter().map(|r| OwnerPidRow {
                state: r.dwState,
                local: IpAddr::V6(Ipv6Addr::from(r.ucLocalAddr)),
                local_port: r.dwLocalPort,
                remote: IpAddr::V6(Ipv6Addr::from(r.ucRemoteAddr)),
                remote_port: r.dwRemotePort,
                pid: r.dwOwningPid,
            }));
        }

        rows
    }
}
