use std::collections::HashSet;
use std::net::TcpListener;

use async_trait::async_trait;
use kforward_commons::PortConflict;
use netstat2::{
    get_sockets_info,
    AddressFamilyFlags,
    ProtocolFlags,
    ProtocolSocketInfo,
};
use sysinfo::{Pid, System};

/// Admission gate for local ports. `check_availability` is called by the Manager before any
/// Worker is started or re-pointed at a new port.
#[async_trait]
pub trait PortChecker: Send + Sync {
    async fn check_availability(
        &self,
        ports: &[(u16, String)],
        skip_ports: &HashSet<u16>,
    ) -> Vec<PortConflict>;
}

/// Resolves owning-process information using `netstat2` for the socket table and `sysinfo` for
/// the pid-to-process-name lookup.
pub struct DefaultPortChecker;

impl DefaultPortChecker {
    pub fn new() -> Self {
        DefaultPortChecker
    }
}

impl Default for DefaultPortChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortChecker for DefaultPortChecker {
    async fn check_availability(
        &self,
        ports: &[(u16, String)],
        skip_ports: &HashSet<u16>,
    ) -> Vec<PortConflict> {
        let mut conflicts = Vec::new();
        for (port, resource) in ports {
            if skip_ports.contains(port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", *port)).is_ok() {
                continue;
            }
            let used_by = find_process_by_port(*port).map(|(_, name)| name);
            conflicts.push(PortConflict {
                port: *port,
                resource: resource.clone(),
                used_by,
            });
        }
        conflicts
    }
}

fn find_process_by_port(port: u16) -> Option<(i32, String)> {
    if port == 0 {
        return None;
    }

    let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let proto_flags = ProtocolFlags::TCP | ProtocolFlags::UDP;

    let sockets_info = get_sockets_info(af_flags, proto_flags).ok()?;

    for socket in sockets_info {
        match &socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp_info) if tcp_info.local_port == port => {
                if let Some(&pid) = socket.associated_pids.first() {
                    return Some((pid as i32, process_name_by_pid(pid as i32)));
                }
            }
            ProtocolSocketInfo::Udp(udp_info) if udp_info.local_port == port => {
                if let Some(&pid) = socket.associated_pids.first() {
                    return Some((pid as i32, process_name_by_pid(pid as i32)));
                }
            }
            _ => continue,
        }
    }

    None
}

fn process_name_by_pid(pid: i32) -> String {
    let mut system = System::new_all();
    system.refresh_all();

    if let Some(process) = system.process(Pid::from(pid as usize)) {
        process.name().to_string_lossy().into_owned()
    } else {
        format!("pid {pid} not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_has_no_conflict() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = DefaultPortChecker::new();
        let conflicts = checker
            .check_availability(&[(port, "pod/app".to_string())], &HashSet::new())
            .await;
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn held_port_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = DefaultPortChecker::new();
        let conflicts = checker
            .check_availability(&[(port, "pod/app".to_string())], &HashSet::new())
            .await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].port, port);

        drop(listener);
    }

    #[tokio::test]
    async fn skip_ports_are_not_checked() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = DefaultPortChecker::new();
        let mut skip = HashSet::new();
        skip.insert(port);
        let conflicts = checker
            .check_availability(&[(port, "pod/app".to_string())], &skip)
            .await;
        assert!(conflicts.is_empty());

        drop(listener);
    }
}
