//! Periodic scan of listening TCP ports.
//!
//! Reads `/proc/net/tcp{,6}` for sockets in LISTEN state, attributes them
//! to processes via `/proc/*/fd`, and reports diffs against the previous
//! snapshot as auto messages. Processes marked with the ignore-ports
//! environment variable are filtered out. On non-Linux hosts the scan is
//! a best-effort no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mend_core::config::IGNORE_PORTS_ENV;
use mend_core::{AgentMessage, MendError, MessageKind, Port, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fanout::MessageLog;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MonitorState {
    running: bool,
    cancel: Option<CancellationToken>,
    ports: Vec<Port>,
}

/// Watches listening TCP ports and publishes changes to the message log.
pub struct PortMonitor {
    log: Arc<MessageLog>,
    interval: Duration,
    state: Mutex<MonitorState>,
}

impl PortMonitor {
    /// A non-positive interval selects the 5 s default.
    pub fn new(log: Arc<MessageLog>, interval: Duration) -> Arc<Self> {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        Arc::new(Self {
            log,
            interval,
            state: Mutex::new(MonitorState::default()),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Last observed snapshot, sorted by port.
    pub fn ports(&self) -> Vec<Port> {
        self.state.lock().unwrap().ports.clone()
    }

    /// Start the monitor task. Starting an already-running monitor is an
    /// error.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(MendError::Agent("port monitor already running".to_string()));
            }
            let cancel = CancellationToken::new();
            state.running = true;
            state.cancel = Some(cancel.clone());
            cancel
        };

        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                monitor.poll_once();
                tokio::select! {
                    _ = tokio::time::sleep(monitor.interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
        Ok(())
    }

    /// Stop the monitor. Stopping a stopped monitor is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.running = false;
    }

    fn poll_once(&self) {
        let mut current = scan_listening_tcp_ports();
        current.retain(|p| !should_ignore_process(p.pid));
        sort_ports(&mut current);

        let previous = {
            let state = self.state.lock().unwrap();
            state.ports.clone()
        };
        let added = find_added_ports(&previous, &current);
        let removed = find_removed_ports(&previous, &current);

        if !added.is_empty() || !removed.is_empty() {
            debug!(added = added.len(), removed = removed.len(), "port changes detected");
            self.log
                .append(port_change_message(&added, &removed));
        }

        self.state.lock().unwrap().ports = current;
    }
}

fn port_change_message(added: &[Port], removed: &[Port]) -> AgentMessage {
    let mut content = String::from("Port monitoring detected changes:\n");
    if !added.is_empty() {
        content.push_str("New ports listening:\n");
        for p in added {
            content.push_str(&format!(
                "- {} port {} ({}, pid {})\n",
                p.proto, p.port, p.process, p.pid
            ));
        }
    }
    if !removed.is_empty() {
        content.push_str("Ports no longer listening:\n");
        for p in removed {
            content.push_str(&format!(
                "- {} port {} ({}, pid {})\n",
                p.proto, p.port, p.process, p.pid
            ));
        }
    }
    AgentMessage::new(MessageKind::Auto, content.trim_end().to_string())
}

pub fn sort_ports(ports: &mut [Port]) {
    ports.sort_by_key(|p| (p.port, p.pid));
}

/// Ports present in `current` but not `previous`.
pub fn find_added_ports(previous: &[Port], current: &[Port]) -> Vec<Port> {
    current
        .iter()
        .filter(|c| !previous.iter().any(|p| p.port == c.port && p.proto == c.proto))
        .cloned()
        .collect()
}

/// Ports present in `previous` but not `current`.
pub fn find_removed_ports(previous: &[Port], current: &[Port]) -> Vec<Port> {
    find_added_ports(current, previous)
}

/// True when the process opted out of port monitoring via the marker
/// environment variable. Linux-only; best effort elsewhere.
pub fn should_ignore_process(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        let Ok(environ) = std::fs::read(format!("/proc/{pid}/environ")) else {
            return false;
        };
        let marker = format!("{IGNORE_PORTS_ENV}=1");
        environ
            .split(|b| *b == 0)
            .any(|entry| entry == marker.as_bytes())
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Snapshot of listening TCP sockets on localhost.
pub fn scan_listening_tcp_ports() -> Vec<Port> {
    #[cfg(target_os = "linux")]
    {
        linux::scan()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;

    use mend_core::Port;

    const TCP_LISTEN: &str = "0A";

    /// inode -> (proto, port) for listening sockets.
    fn listening_inodes() -> HashMap<u64, (String, u16)> {
        let mut inodes = HashMap::new();
        for (path, proto) in [("/proc/net/tcp", "tcp"), ("/proc/net/tcp6", "tcp")] {
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            for line in contents.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 {
                    continue;
                }
                if fields[3] != TCP_LISTEN {
                    continue;
                }
                let Some(port_hex) = fields[1].rsplit(':').next() else {
                    continue;
                };
                let Ok(port) = u16::from_str_radix(port_hex, 16) else {
                    continue;
                };
                let Ok(inode) = fields[9].parse::<u64>() else {
                    continue;
                };
                inodes.insert(inode, (proto.to_string(), port));
            }
        }
        inodes
    }

    pub fn scan() -> Vec<Port> {
        let inodes = listening_inodes();
        if inodes.is_empty() {
            return Vec::new();
        }

        let mut ports = Vec::new();
        let Ok(proc_entries) = std::fs::read_dir("/proc") else {
            return ports;
        };
        for entry in proc_entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
                continue;
            };
            let process = std::fs::read_to_string(format!("/proc/{pid}/comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            for fd in fds.flatten() {
                let Ok(target) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                let target = target.to_string_lossy();
                let Some(inode_str) = target
                    .strip_prefix("socket:[")
                    .and_then(|s| s.strip_suffix(']'))
                else {
                    continue;
                };
                let Ok(inode) = inode_str.parse::<u64>() else {
                    continue;
                };
                if let Some((proto, port)) = inodes.get(&inode) {
                    ports.push(Port {
                        proto: proto.clone(),
                        port: *port,
                        pid,
                        process: process.clone(),
                    });
                }
            }
        }
        // A socket may be shared by several processes; keep the first
        // observation per (proto, port, pid).
        ports.sort_by(|a, b| (a.port, a.pid).cmp(&(b.port, b.pid)));
        ports.dedup();
        ports
    }
}
